#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use chaos_core::ExecutionConfig;
    use chaos_domain::{
        FaultSpec, OrchestratorError, OrchestratorResult, TargetRef, Task, TaskRepository,
        TaskStatus, TaskType,
    };
    use chaos_infrastructure::{BroadcastEventBus, InMemoryTaskRepository};
    use chaos_worker::{
        ChildTaskPort, DeferredOperations, FanOutTaskHelper, StageContext, SubstageDriver,
        TaskHelper,
    };

    struct FakeChildren {
        store: Arc<InMemoryTaskRepository>,
        outcomes: HashMap<String, TaskStatus>,
        launched: Mutex<Vec<Task>>,
        remediated: Mutex<Vec<String>>,
    }

    impl FakeChildren {
        fn new(store: Arc<InMemoryTaskRepository>, outcomes: &[(&str, TaskStatus)]) -> Arc<Self> {
            Arc::new(Self {
                store,
                outcomes: outcomes
                    .iter()
                    .map(|(id, status)| (id.to_string(), *status))
                    .collect(),
                launched: Mutex::new(Vec::new()),
                remediated: Mutex::new(Vec::new()),
            })
        }

        fn launched(&self) -> Vec<Task> {
            self.launched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChildTaskPort for FakeChildren {
        async fn launch_child(&self, mut child: Task) -> OrchestratorResult<Task> {
            let target_id = child.task_data.targets[0].id.clone();
            child.start_new_trigger("node-b");
            match self.outcomes.get(&target_id).copied() {
                Some(TaskStatus::Failed) => {
                    child.append_failure_reason("agent unreachable");
                    child.set_status(TaskStatus::Failed);
                }
                Some(status) => child.set_status(status),
                None => {}
            }
            let saved = self.store.save(&child).await?;
            self.launched.lock().unwrap().push(saved.clone());
            Ok(saved)
        }

        async fn remediate_child(&self, child_id: &str) -> OrchestratorResult<Task> {
            let injection = self
                .store
                .get(child_id)
                .await?
                .ok_or_else(|| OrchestratorError::task_not_found(child_id))?;
            let mut remediation = Task::remediation_of(&injection);
            remediation.start_new_trigger("node-b");
            remediation.set_status(TaskStatus::Completed);
            self.remediated.lock().unwrap().push(child_id.to_string());
            self.store.save(&remediation).await
        }
    }

    fn driver(store: &Arc<InMemoryTaskRepository>) -> SubstageDriver {
        let ctx = StageContext {
            node_id: "node-a".to_string(),
            store: store.clone(),
            deferred: DeferredOperations::new(),
            config: ExecutionConfig::default(),
        };
        SubstageDriver::new(ctx, Arc::new(BroadcastEventBus::new(256)))
    }

    fn parent(targets: &[&str]) -> Task {
        let mut data = FaultSpec::new("pod-kill", "fan-out", "cluster-a");
        data.targets = targets.iter().map(|id| TargetRef::new("Pod", *id)).collect();
        data.child_extension_name = Some("pod-fault".to_string());
        Task::new(TaskType::Trigger, data)
    }

    #[tokio::test(start_paused = true)]
    async fn completes_when_every_child_succeeds() {
        let store = Arc::new(InMemoryTaskRepository::new());
        let children = FakeChildren::new(
            store.clone(),
            &[("a", TaskStatus::Completed), ("b", TaskStatus::Completed)],
        );
        let helper = Arc::new(FanOutTaskHelper::new("fan-out", children.clone()));
        let task = store.save(&parent(&["a", "b"])).await.unwrap();

        let task = driver(&store).drive(task, helper, false).await.unwrap();

        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.child_task_ids().len(), 2);
        let output = task.output().unwrap();
        for child in children.launched() {
            assert_eq!(child.parent_task_id.as_deref(), Some(task.id.as_str()));
            assert_eq!(child.extension_name, "pod-fault");
            assert!(output.contains(&format!("Result: SUCCESS {}", child.id)));
        }
        assert!(task.failure_reason().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_child_fails_the_parent_and_names_the_target() {
        let store = Arc::new(InMemoryTaskRepository::new());
        let children = FakeChildren::new(
            store.clone(),
            &[("a", TaskStatus::Completed), ("b", TaskStatus::Failed)],
        );
        let helper = Arc::new(FanOutTaskHelper::new("fan-out", children));
        let task = store.save(&parent(&["a", "b"])).await.unwrap();

        let task = driver(&store).drive(task, helper, false).await.unwrap();

        assert_eq!(task.status(), TaskStatus::Failed);
        let reason = task.failure_reason().unwrap();
        assert!(reason.contains("Pod: b agent unreachable"));
        assert!(reason.contains("Child tasks failed for targets: Pod: b"));
        assert!(!reason.contains("Pod: a"));
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_children_that_finish_later() {
        let store = Arc::new(InMemoryTaskRepository::new());
        let children = FakeChildren::new(store.clone(), &[]);
        let helper = Arc::new(FanOutTaskHelper::new("fan-out", children.clone()));
        let task = store.save(&parent(&["a"])).await.unwrap();

        let drive_store = store.clone();
        let handle =
            tokio::spawn(async move { driver(&drive_store).drive(task, helper, false).await });

        tokio::time::sleep(Duration::from_secs(3)).await;
        let launched = children.launched();
        assert_eq!(launched.len(), 1);
        let mut child = store.get(&launched[0].id).await.unwrap().unwrap();
        child.set_status(TaskStatus::Completed);
        store.save(&child).await.unwrap();

        let task = handle.await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);
        let output = task.output().unwrap();
        assert_eq!(output.matches("Result: SUCCESS").count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn random_injection_picks_a_single_target() {
        let store = Arc::new(InMemoryTaskRepository::new());
        let children = FakeChildren::new(
            store.clone(),
            &[
                ("a", TaskStatus::Completed),
                ("b", TaskStatus::Completed),
                ("c", TaskStatus::Completed),
            ],
        );
        let helper = Arc::new(FanOutTaskHelper::new("fan-out", children.clone()));
        let mut task = parent(&["a", "b", "c"]);
        task.task_data.random_injection = true;
        let task = store.save(&task).await.unwrap();

        let task = driver(&store).drive(task, helper, false).await.unwrap();

        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(children.launched().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_parent_does_not_relaunch_children() {
        let store = Arc::new(InMemoryTaskRepository::new());
        let children = FakeChildren::new(store.clone(), &[]);
        let helper = Arc::new(FanOutTaskHelper::new("fan-out", children.clone()));

        let mut task = parent(&["a"]);
        let target = TargetRef::new("Pod", "a");
        let mut child = Task::child_of(&task, &target, "pod-fault");
        child.start_new_trigger("node-b");
        child.set_status(TaskStatus::Completed);
        let child = store.save(&child).await.unwrap();
        task.start_new_trigger("node-dead")
            .record_child(target, child.id.clone());
        task.set_substage(
            chaos_domain::SubStage::TriggerInjection,
            chaos_domain::StageState::Started,
        );
        let task = store.save(&task).await.unwrap();

        let task = driver(&store).drive(task, helper, false).await.unwrap();

        assert_eq!(task.status(), TaskStatus::Completed);
        assert!(children.launched().is_empty());
        assert_eq!(task.child_task_ids(), &[child.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn remediation_remediates_each_injected_child() {
        let store = Arc::new(InMemoryTaskRepository::new());
        let children = FakeChildren::new(
            store.clone(),
            &[("a", TaskStatus::Completed), ("b", TaskStatus::Completed)],
        );
        let helper: Arc<dyn TaskHelper> =
            Arc::new(FanOutTaskHelper::new("fan-out", children.clone()));
        let driver = driver(&store);

        let injection = store.save(&parent(&["a", "b"])).await.unwrap();
        let mut injection = driver
            .drive(injection, Arc::clone(&helper), false)
            .await
            .unwrap();
        let remediation = Task::remediation_of(&injection);
        injection.remediated = true;
        injection.remediation_task_id = Some(remediation.id.clone());
        store.save(&injection).await.unwrap();
        let remediation = store.save(&remediation).await.unwrap();

        let remediation = driver.drive(remediation, helper, false).await.unwrap();

        assert_eq!(remediation.status(), TaskStatus::Completed);
        let mut remediated = children.remediated.lock().unwrap().clone();
        remediated.sort();
        let mut injected: Vec<String> = injection.child_task_ids().to_vec();
        injected.sort();
        assert_eq!(remediated, injected);
        assert_eq!(remediation.child_task_ids().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_parent_is_not_remediated() {
        let store = Arc::new(InMemoryTaskRepository::new());
        let children = FakeChildren::new(
            store.clone(),
            &[("a", TaskStatus::Completed), ("b", TaskStatus::Failed)],
        );
        let helper: Arc<dyn TaskHelper> =
            Arc::new(FanOutTaskHelper::new("fan-out", children.clone()));
        let driver = driver(&store);

        let injection = store.save(&parent(&["a", "b"])).await.unwrap();
        let mut injection = driver
            .drive(injection, Arc::clone(&helper), false)
            .await
            .unwrap();
        assert_eq!(injection.status(), TaskStatus::Failed);
        let remediation = Task::remediation_of(&injection);
        injection.remediated = true;
        injection.remediation_task_id = Some(remediation.id.clone());
        store.save(&injection).await.unwrap();
        let remediation = store.save(&remediation).await.unwrap();

        let remediation = driver.drive(remediation, helper, false).await.unwrap();

        assert_eq!(remediation.status(), TaskStatus::Failed);
        assert!(remediation
            .failure_reason()
            .unwrap()
            .contains("not in a valid state for remediation"));
        assert!(children.remediated.lock().unwrap().is_empty());
        let injection = store.get(&injection.id).await.unwrap().unwrap();
        assert!(!injection.remediated);
        assert_eq!(injection.status(), TaskStatus::Failed);
    }

    #[test]
    fn validation_requires_targets_and_child_extension() {
        let store = Arc::new(InMemoryTaskRepository::new());
        let helper = FanOutTaskHelper::new("fan-out", FakeChildren::new(store, &[]));

        assert!(helper.validate(&parent(&["a"]).task_data).is_ok());
        assert!(helper.validate(&parent(&[]).task_data).is_err());
        let mut data = parent(&["a"]).task_data;
        data.child_extension_name = None;
        assert!(helper.validate(&data).is_err());
        assert_eq!(helper.injection_task_type(), TaskType::Trigger);
    }
}
