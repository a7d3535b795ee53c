#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chaos_core::ExecutionConfig;
    use chaos_domain::{
        FaultSpec, OrchestratorError, OrchestratorResult, StageState, SubStage, Task,
        TaskRepository, TaskStatus, TaskType,
    };
    use chaos_infrastructure::{BroadcastEventBus, InMemoryTaskRepository};
    use chaos_worker::{DeferredOperations, StageContext, SubstageDriver, TaskHelper};

    struct ScriptedHelper {
        calls: Arc<Mutex<Vec<SubStage>>>,
        fail_at: Option<SubStage>,
    }

    impl ScriptedHelper {
        fn new(fail_at: Option<SubStage>) -> (Arc<Self>, Arc<Mutex<Vec<SubStage>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let helper = Arc::new(Self {
                calls: Arc::clone(&calls),
                fail_at,
            });
            (helper, calls)
        }

        fn record(&self, stage: SubStage, task: &mut Task) -> OrchestratorResult<()> {
            self.calls.lock().unwrap().push(stage);
            if self.fail_at == Some(stage) {
                return Err(OrchestratorError::CommandExecution {
                    command: "stress-ng --cpu 4".into(),
                    exit_code: 1,
                    output: "stress-ng: not found".into(),
                });
            }
            task.append_output(&format!("{stage} done"));
            Ok(())
        }
    }

    #[async_trait]
    impl TaskHelper for ScriptedHelper {
        fn extension_name(&self) -> &str {
            "scripted"
        }

        fn description(&self, task: &Task) -> String {
            format!("scripted {}", task.task_name)
        }

        async fn check_prerequisites(&self, task: &mut Task, _ctx: &StageContext) -> OrchestratorResult<()> {
            self.record(SubStage::PrerequisitesCheck, task)
        }

        async fn prepare_target(&self, task: &mut Task, _ctx: &StageContext) -> OrchestratorResult<()> {
            self.record(SubStage::PrepareTargetMachine, task)
        }

        async fn trigger_injection(&self, task: &mut Task, _ctx: &StageContext) -> OrchestratorResult<()> {
            self.record(SubStage::TriggerInjection, task)
        }

        async fn check_remediation_prerequisites(
            &self,
            task: &mut Task,
            _ctx: &StageContext,
        ) -> OrchestratorResult<()> {
            self.record(SubStage::RemediationPrerequisitesCheck, task)
        }

        async fn trigger_remediation(&self, task: &mut Task, _ctx: &StageContext) -> OrchestratorResult<()> {
            self.record(SubStage::TriggerRemediation, task)
        }
    }

    struct Fixture {
        store: Arc<InMemoryTaskRepository>,
        deferred: DeferredOperations,
        bus: BroadcastEventBus,
        driver: Arc<SubstageDriver>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryTaskRepository::new());
        let deferred = DeferredOperations::new();
        let bus = BroadcastEventBus::new(256);
        let ctx = StageContext {
            node_id: "node-a".to_string(),
            store: store.clone(),
            deferred: deferred.clone(),
            config: ExecutionConfig::default(),
        };
        let driver = Arc::new(SubstageDriver::new(ctx, Arc::new(bus.clone())));
        Fixture {
            store,
            deferred,
            bus,
            driver,
        }
    }

    fn injection() -> Task {
        Task::new(
            TaskType::Injection,
            FaultSpec::new("cpu-burn", "scripted", "vm-01"),
        )
    }

    fn timed_injection() -> Task {
        let mut data = FaultSpec::new("cpu-burn", "scripted", "vm-01");
        data.long_lasting = true;
        data.timeout_in_milliseconds = Some(10_000);
        Task::new(TaskType::Injection, data)
    }

    #[tokio::test]
    async fn one_shot_injection_runs_every_stage_in_order() {
        let f = fixture();
        let mut substages = f.bus.subscribe_substage();
        let (helper, calls) = ScriptedHelper::new(None);
        let task = f.store.save(&injection()).await.unwrap();

        let task = f.driver.drive(task, helper, false).await.unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                SubStage::PrerequisitesCheck,
                SubStage::PrepareTargetMachine,
                SubStage::TriggerInjection
            ]
        );
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.triggers.len(), 1);
        assert_eq!(task.active_trigger().unwrap().node.as_deref(), Some("node-a"));
        assert_eq!(task.task_description, "scripted cpu-burn");

        let stored = f.store.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), TaskStatus::Completed);
        assert_eq!(stored.current_stage(), Some(SubStage::TriggerInjection));
        assert_eq!(stored.stage_state(), Some(StageState::Completed));

        let mut received = 0;
        while substages.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 6);
    }

    #[tokio::test]
    async fn resume_skips_completed_stages() {
        let f = fixture();
        let (helper, calls) = ScriptedHelper::new(None);
        let mut task = injection();
        task.start_new_trigger("node-dead");
        task.set_substage(SubStage::PrepareTargetMachine, StageState::Completed);
        let task = f.store.save(&task).await.unwrap();

        let task = f.driver.drive(task, helper, false).await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![SubStage::TriggerInjection]);
        assert_eq!(task.triggers.len(), 1);
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.active_trigger().unwrap().node.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn resume_reruns_a_started_stage() {
        let f = fixture();
        let (helper, calls) = ScriptedHelper::new(None);
        let mut task = injection();
        task.start_new_trigger("node-dead");
        task.set_substage(SubStage::TriggerInjection, StageState::Started);
        let task = f.store.save(&task).await.unwrap();

        f.driver.drive(task, helper, false).await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![SubStage::TriggerInjection]);
    }

    #[tokio::test]
    async fn fresh_trigger_keeps_history_and_starts_over() {
        let f = fixture();
        let (helper, calls) = ScriptedHelper::new(None);
        let mut task = injection();
        task.start_new_trigger("node-a");
        task.set_substage(SubStage::TriggerInjection, StageState::Completed);
        task.set_status(TaskStatus::Completed);
        let task = f.store.save(&task).await.unwrap();

        let task = f.driver.drive(task, helper, true).await.unwrap();

        assert_eq!(task.triggers.len(), 2);
        assert_eq!(task.triggers[0].task_status, TaskStatus::Completed);
        assert_eq!(task.status(), TaskStatus::Completed);
        // 上一次运行已完成，准备阶段不再调用扩展
        assert_eq!(
            *calls.lock().unwrap(),
            vec![SubStage::PrerequisitesCheck, SubStage::TriggerInjection]
        );
    }

    #[tokio::test]
    async fn injection_failure_mentions_partial_side_effects() {
        let f = fixture();
        let mut completed = f.bus.subscribe_completed();
        let (helper, _) = ScriptedHelper::new(Some(SubStage::TriggerInjection));
        let task = f.store.save(&injection()).await.unwrap();

        let task = f.driver.drive(task, helper, false).await.unwrap();

        assert_eq!(task.status(), TaskStatus::Failed);
        let reason = task.failure_reason().unwrap();
        assert!(reason.contains("TRIGGER_INJECTION failed"));
        assert!(reason.contains("stress-ng: not found"));
        assert!(reason.contains("Partial side effects"));
        assert_eq!(completed.try_recv().unwrap().task.id, task.id);
    }

    #[tokio::test]
    async fn prerequisite_failure_has_no_side_effect_note() {
        let f = fixture();
        let (helper, calls) = ScriptedHelper::new(Some(SubStage::PrerequisitesCheck));
        let task = f.store.save(&injection()).await.unwrap();

        let task = f.driver.drive(task, helper, false).await.unwrap();

        assert_eq!(task.status(), TaskStatus::Failed);
        assert!(!task.failure_reason().unwrap().contains("Partial side effects"));
        assert_eq!(*calls.lock().unwrap(), vec![SubStage::PrerequisitesCheck]);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_fault_remediates_itself_after_the_timeout() {
        let f = fixture();
        let (helper, calls) = ScriptedHelper::new(None);
        let task = f.store.save(&timed_injection()).await.unwrap();
        let task_id = task.id.clone();

        let driver = Arc::clone(&f.driver);
        let handle = tokio::spawn(async move { driver.drive(task, helper, false).await });

        tokio::time::sleep(Duration::from_secs(5)).await;
        let waiting = f.store.get(&task_id).await.unwrap().unwrap();
        assert_eq!(waiting.status(), TaskStatus::InProgress);
        assert_eq!(waiting.current_stage(), Some(SubStage::TriggerInjection));
        assert_eq!(waiting.stage_state(), Some(StageState::Completed));
        assert_eq!(f.deferred.pending(&task_id).await, 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let task = handle.await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(task.remediated);
        assert_eq!(
            calls.lock().unwrap().last().copied(),
            Some(SubStage::TriggerRemediation)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_leaves_the_task_for_explicit_remediation() {
        let f = fixture();
        let (helper, calls) = ScriptedHelper::new(None);
        let task = f.store.save(&timed_injection()).await.unwrap();
        let task_id = task.id.clone();

        let driver = Arc::clone(&f.driver);
        let handle = tokio::spawn(async move { driver.drive(task, helper, false).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        let cancelled = f
            .deferred
            .cancel_all(&task_id, Duration::from_millis(100))
            .await;
        assert_eq!(cancelled, 1);

        let task = handle.await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::InProgress);
        assert!(!calls
            .lock()
            .unwrap()
            .contains(&SubStage::TriggerRemediation));
    }

    async fn remediation_pair(f: &Fixture, injection_status: TaskStatus) -> (Task, Task) {
        let mut injection = timed_injection();
        injection.start_new_trigger("node-b");
        injection.set_substage(SubStage::TriggerInjection, StageState::Completed);
        injection.set_status(injection_status);
        let mut remediation = Task::remediation_of(&injection);
        injection.remediated = true;
        injection.remediation_task_id = Some(remediation.id.clone());
        let injection = f.store.save(&injection).await.unwrap();
        remediation = f.store.save(&remediation).await.unwrap();
        (injection, remediation)
    }

    #[tokio::test]
    async fn remediation_completes_the_running_injection() {
        let f = fixture();
        let (helper, calls) = ScriptedHelper::new(None);
        let (injection, remediation) = remediation_pair(&f, TaskStatus::InProgress).await;

        let remediation = f.driver.drive(remediation, helper, false).await.unwrap();

        assert_eq!(remediation.status(), TaskStatus::Completed);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                SubStage::RemediationPrerequisitesCheck,
                SubStage::TriggerRemediation
            ]
        );
        let injection = f.store.get(&injection.id).await.unwrap().unwrap();
        assert!(injection.remediated);
        assert_eq!(injection.status(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn failed_remediation_can_be_requested_again() {
        let f = fixture();
        let (helper, _) = ScriptedHelper::new(Some(SubStage::TriggerRemediation));
        let (injection, remediation) = remediation_pair(&f, TaskStatus::Completed).await;

        let remediation = f.driver.drive(remediation, helper, false).await.unwrap();

        assert_eq!(remediation.status(), TaskStatus::Failed);
        let injection = f.store.get(&injection.id).await.unwrap().unwrap();
        assert!(!injection.remediated);
        assert!(injection.remediation_task_id.is_none());
    }

    #[test]
    fn stage_plans_follow_the_task_kind() {
        assert_eq!(SubstageDriver::stage_plan(&injection()).len(), 3);
        assert_eq!(
            SubstageDriver::stage_plan(&timed_injection()).last(),
            Some(&SubStage::TriggerRemediation)
        );
        assert_eq!(
            SubstageDriver::stage_plan(&Task::remediation_of(&injection())),
            vec![
                SubStage::RemediationPrerequisitesCheck,
                SubStage::TriggerRemediation
            ]
        );
    }
}
