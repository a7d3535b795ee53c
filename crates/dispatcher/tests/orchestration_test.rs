#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use chaos_core::{ClusterConfig, ExecutionConfig};
    use chaos_dispatcher::{HelperInstaller, NodeRuntime, TaskOrchestrator};
    use chaos_domain::{
        FaultSpec, OrchestratorError, OrchestratorResult, OwnershipMap, StageState, SubStage,
        Task, TaskFilter, TaskRepository, TaskStatus, TaskType,
    };
    use chaos_infrastructure::{InMemoryCluster, InMemoryTaskRepository};
    use chaos_worker::{StageContext, TaskHelper};

    #[derive(Default)]
    struct Counters {
        prerequisites: AtomicUsize,
        injections: AtomicUsize,
        remediations: AtomicUsize,
    }

    struct DelayHelper {
        counters: Arc<Counters>,
        injection_delay: Duration,
    }

    #[async_trait]
    impl TaskHelper for DelayHelper {
        fn extension_name(&self) -> &str {
            "scripted"
        }

        fn description(&self, task: &Task) -> String {
            format!("scripted {}", task.task_name)
        }

        async fn check_prerequisites(&self, task: &mut Task, _ctx: &StageContext) -> OrchestratorResult<()> {
            self.counters.prerequisites.fetch_add(1, Ordering::SeqCst);
            task.append_output("Endpoint vm-01 is reachable");
            Ok(())
        }

        async fn trigger_injection(&self, task: &mut Task, _ctx: &StageContext) -> OrchestratorResult<()> {
            self.counters.injections.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.injection_delay).await;
            task.append_output("Completed Fault Injection");
            Ok(())
        }

        async fn check_remediation_prerequisites(
            &self,
            _task: &mut Task,
            _ctx: &StageContext,
        ) -> OrchestratorResult<()> {
            Ok(())
        }

        async fn trigger_remediation(&self, task: &mut Task, _ctx: &StageContext) -> OrchestratorResult<()> {
            self.counters.remediations.fetch_add(1, Ordering::SeqCst);
            task.append_output("Completed Fault Remediation");
            Ok(())
        }
    }

    struct Fixture {
        cluster: InMemoryCluster,
        store: Arc<InMemoryTaskRepository>,
        counters: Arc<Counters>,
        installer: HelperInstaller,
    }

    fn fixture(injection_delay: Duration) -> Fixture {
        let counters = Arc::new(Counters::default());
        let helper = Arc::new(DelayHelper {
            counters: Arc::clone(&counters),
            injection_delay,
        });
        let installer: HelperInstaller =
            Arc::new(move |_children| vec![helper.clone() as Arc<dyn TaskHelper>]);
        Fixture {
            cluster: InMemoryCluster::new(&ClusterConfig::default()),
            store: Arc::new(InMemoryTaskRepository::new()),
            counters,
            installer,
        }
    }

    impl Fixture {
        async fn node(&self, node_id: &str) -> NodeRuntime {
            NodeRuntime::start(
                node_id,
                &self.cluster,
                self.store.clone(),
                ExecutionConfig::default(),
                &self.installer,
            )
            .await
            .unwrap()
        }

        async fn wait_for<F>(&self, task_id: &str, predicate: F) -> Task
        where
            F: Fn(&Task) -> bool,
        {
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                if let Some(task) = self.store.get(task_id).await.unwrap() {
                    if predicate(&task) {
                        return task;
                    }
                }
                assert!(Instant::now() < deadline, "任务 {task_id} 未在期限内达到预期状态");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        async fn wait_for_entry(&self, node_id: &str, task_id: &str, expected: Option<&str>) {
            let handle = self.cluster.handle(node_id);
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                if handle.get(task_id).await.unwrap().as_deref() == expected {
                    return;
                }
                assert!(Instant::now() < deadline, "任务 {task_id} 的所有权条目不是 {expected:?}");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }

    fn spec() -> FaultSpec {
        FaultSpec::new("cpu-burn", "scripted", "vm-01")
    }

    fn timed_spec() -> FaultSpec {
        let mut spec = spec();
        spec.long_lasting = true;
        spec.timeout_in_milliseconds = Some(60_000);
        spec
    }

    #[tokio::test]
    async fn submitted_task_is_driven_to_completion() {
        let f = fixture(Duration::ZERO);
        let node = f.node("node-a").await;

        let task = node.orchestrator().submit(spec()).await.unwrap();
        assert_eq!(task.status(), TaskStatus::Initializing);
        assert!(task.triggers.is_empty());

        let task = f.wait_for(&task.id, |t| t.is_terminal()).await;
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.triggers.len(), 1);
        assert_eq!(task.current_stage(), Some(SubStage::TriggerInjection));
        assert!(task.output().unwrap().contains("Completed Fault Injection"));

        f.wait_for_entry("node-a", &task.id, None).await;
        let task = f
            .wait_for(&task.id, |t| {
                t.active_trigger().is_some_and(|tr| tr.is_trigger_metric_collected)
            })
            .await;
        assert_eq!(task.triggers.len(), 1);
    }

    #[tokio::test]
    async fn unknown_extension_is_rejected_without_creating_a_task() {
        let f = fixture(Duration::ZERO);
        let node = f.node("node-a").await;

        let result = node
            .orchestrator()
            .submit(FaultSpec::new("cpu-burn", "missing", "vm-01"))
            .await;

        assert!(matches!(
            result,
            Err(OrchestratorError::UnsupportedExtension { .. })
        ));
        assert!(node
            .orchestrator()
            .find_tasks(&TaskFilter::default())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(f.cluster.entry_count().await, 0);
    }

    #[tokio::test]
    async fn redelivered_entry_for_completed_task_is_removed_without_rerun() {
        let f = fixture(Duration::ZERO);
        let node = f.node("node-a").await;
        let orchestrator = node.orchestrator();

        let task = orchestrator.submit(spec()).await.unwrap();
        f.wait_for(&task.id, |t| t.status() == TaskStatus::Completed)
            .await;
        f.wait_for_entry("node-a", &task.id, None).await;

        f.cluster
            .handle("node-a")
            .add_or_update(&task.id, "COMPLETED")
            .await
            .unwrap();
        f.wait_for_entry("node-a", &task.id, None).await;

        let task = orchestrator.get_task(&task.id).await.unwrap();
        assert_eq!(task.triggers.len(), 1);
        assert_eq!(f.counters.injections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn redelivered_entry_for_running_task_does_not_drive_twice() {
        let f = fixture(Duration::from_millis(500));
        let node = f.node("node-a").await;

        let task = node.orchestrator().submit(spec()).await.unwrap();
        f.wait_for(&task.id, |t| {
            t.current_stage() == Some(SubStage::TriggerInjection)
                && t.stage_state() == Some(StageState::Started)
        })
        .await;

        let handle = f.cluster.handle("node-a");
        handle.remove(&task.id).await.unwrap();
        handle.add_or_update(&task.id, "IN_PROGRESS").await.unwrap();

        let task = f.wait_for(&task.id, |t| t.is_terminal()).await;
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.triggers.len(), 1);
        assert_eq!(f.counters.injections.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_remediation_requests_create_a_single_remediation() {
        let f = fixture(Duration::ZERO);
        let node = f.node("node-a").await;
        let orchestrator = node.orchestrator();

        let injection = orchestrator.submit(timed_spec()).await.unwrap();
        f.wait_for(&injection.id, |t| {
            t.current_stage() == Some(SubStage::TriggerInjection)
                && t.stage_state() == Some(StageState::Completed)
        })
        .await;

        let (first, second) = tokio::join!(
            orchestrator.remediate(&injection.id),
            orchestrator.remediate(&injection.id)
        );
        let (remediation, rejected) = match (first, second) {
            (Ok(task), Err(e)) | (Err(e), Ok(task)) => (task, e),
            other => panic!("expected exactly one accepted remediation, got {other:?}"),
        };
        assert!(matches!(rejected, OrchestratorError::AlreadyRemediated { .. }));
        assert_eq!(remediation.task_type, TaskType::Remediation);
        assert_eq!(remediation.injection_task_id.as_deref(), Some(injection.id.as_str()));

        let remediation = f.wait_for(&remediation.id, |t| t.is_terminal()).await;
        assert_eq!(remediation.status(), TaskStatus::Completed);

        let injection = f.wait_for(&injection.id, |t| t.is_terminal()).await;
        assert_eq!(injection.status(), TaskStatus::Completed);
        assert!(injection.remediated);
        assert!(injection.output().unwrap().contains("Remediated by task"));

        let remediations = orchestrator
            .find_tasks(&TaskFilter {
                task_type: Some(TaskType::Remediation),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(remediations.len(), 1);
        assert_eq!(f.counters.remediations.load(Ordering::SeqCst), 1);
        assert!(matches!(
            orchestrator.remediate(&injection.id).await,
            Err(OrchestratorError::AlreadyRemediated { .. })
        ));
    }

    #[tokio::test]
    async fn remediation_waits_until_the_injection_has_landed() {
        let f = fixture(Duration::from_millis(500));
        let node = f.node("node-a").await;
        let orchestrator = node.orchestrator();

        let injection = orchestrator.submit(timed_spec()).await.unwrap();
        f.wait_for(&injection.id, |t| {
            t.current_stage() == Some(SubStage::TriggerInjection)
                && t.stage_state() == Some(StageState::Started)
        })
        .await;

        let early = orchestrator.remediate(&injection.id).await;
        assert!(matches!(
            early,
            Err(OrchestratorError::InvalidStateForRemediation { .. })
        ));
        let stored = f.store.get(&injection.id).await.unwrap().unwrap();
        assert!(!stored.remediated);
        assert!(stored.remediation_task_id.is_none());
        assert_eq!(f.counters.remediations.load(Ordering::SeqCst), 0);

        f.wait_for(&injection.id, |t| {
            t.current_stage() == Some(SubStage::TriggerInjection)
                && t.stage_state() == Some(StageState::Completed)
        })
        .await;
        let remediation = orchestrator.remediate(&injection.id).await.unwrap();
        let remediation = f.wait_for(&remediation.id, |t| t.is_terminal()).await;
        assert_eq!(remediation.status(), TaskStatus::Completed);

        let injection = f.wait_for(&injection.id, |t| t.is_terminal()).await;
        assert_eq!(injection.status(), TaskStatus::Completed);
        assert!(injection.remediated);
        assert_eq!(f.counters.injections.load(Ordering::SeqCst), 1);
        assert_eq!(f.counters.remediations.load(Ordering::SeqCst), 1);
        f.wait_for_entry("node-a", &injection.id, None).await;
    }

    #[tokio::test]
    async fn failed_injection_cannot_be_remediated() {
        let f = fixture(Duration::ZERO);
        let node = f.node("node-a").await;
        let mut task = Task::new(TaskType::Injection, spec());
        task.start_new_trigger("node-gone");
        task.set_substage(SubStage::PrerequisitesCheck, StageState::Started);
        task.append_failure_reason("PREREQUISITES_CHECK failed: endpoint unreachable");
        task.set_status(TaskStatus::Failed);
        f.store.save(&task).await.unwrap();

        let result = node.orchestrator().remediate(&task.id).await;

        assert!(matches!(
            result,
            Err(OrchestratorError::InvalidStateForRemediation { .. })
        ));
        let remediations = node
            .orchestrator()
            .find_tasks(&TaskFilter {
                task_type: Some(TaskType::Remediation),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(remediations.is_empty());
        assert_eq!(f.cluster.entry_count().await, 0);
    }

    #[tokio::test]
    async fn remediating_unknown_task_fails_without_touching_the_map() {
        let f = fixture(Duration::ZERO);
        let node = f.node("node-a").await;

        let result = node.orchestrator().remediate("no-such-task").await;

        assert!(matches!(result, Err(OrchestratorError::TaskNotFound { .. })));
        assert_eq!(f.cluster.entry_count().await, 0);
    }

    #[tokio::test]
    async fn remediating_untriggered_task_is_rejected() {
        let f = fixture(Duration::ZERO);
        let node = f.node("node-a").await;
        let task = Task::new(TaskType::Injection, spec());
        f.store.save(&task).await.unwrap();

        let result = node.orchestrator().remediate(&task.id).await;

        assert!(matches!(
            result,
            Err(OrchestratorError::InvalidStateForRemediation { .. })
        ));
        assert!(!f.store.get(&task.id).await.unwrap().unwrap().remediated);
    }

    #[tokio::test]
    async fn surviving_node_resumes_task_from_last_persisted_substage() {
        let f = fixture(Duration::from_millis(400));
        let mut nodes = vec![f.node("node-a").await, f.node("node-b").await];

        let task = nodes[0].orchestrator().submit(spec()).await.unwrap();
        f.wait_for(&task.id, |t| {
            t.current_stage() == Some(SubStage::TriggerInjection)
                && t.stage_state() == Some(StageState::Started)
        })
        .await;

        let owner = f.cluster.owner_of(&task.id).await.unwrap();
        let position = nodes.iter().position(|n| n.node_id() == owner).unwrap();
        let crashed = nodes.remove(position);
        crashed.shutdown().await.unwrap();
        let survivor = nodes[0].node_id().to_string();

        let task = f.wait_for(&task.id, |t| t.is_terminal()).await;
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.triggers.len(), 1);
        assert_eq!(task.active_trigger().unwrap().node.as_deref(), Some(survivor.as_str()));
        assert_eq!(f.counters.prerequisites.load(Ordering::SeqCst), 1);
        assert_eq!(f.counters.injections.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn recovery_reinserts_only_missing_unfinished_work() {
        let f = fixture(Duration::ZERO);

        let pending = Task::new(TaskType::Injection, spec());
        f.store.save(&pending).await.unwrap();

        let mut finished = Task::new(TaskType::Injection, spec());
        finished.start_new_trigger("node-gone");
        finished.set_status(TaskStatus::Completed);
        f.store.save(&finished).await.unwrap();

        let mut schedule_spec = spec();
        schedule_spec.schedule = Some(chaos_domain::ScheduleSpec::cron("0 0 0 1 1 *"));
        let schedule = Task::new(TaskType::Injection, schedule_spec);
        f.store.save(&schedule).await.unwrap();

        let node = f.node("node-a").await;
        let report = node.recovery().rebuild_ownership().await.unwrap();

        assert_eq!(report.reinserted_tasks, vec![pending.id.clone()]);
        assert_eq!(report.reinserted_schedules, vec![schedule.id.clone()]);
        assert!(report.errors.is_empty());

        let pending = f.wait_for(&pending.id, |t| t.is_terminal()).await;
        assert_eq!(pending.status(), TaskStatus::Completed);
        f.wait_for_entry("node-a", &schedule.id, Some("SCHEDULED"))
            .await;

        let report = node.recovery().rebuild_ownership().await.unwrap();
        assert!(report.reinserted_tasks.is_empty());
        assert!(report.reinserted_schedules.is_empty());
    }
}
