#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use chaos_domain::{
        CommandExecutionResult, CommandExecutor, CommandInfo, OrchestratorError, OrchestratorResult,
    };
    use chaos_worker::CommandRunner;
    use mockall::{mock, Sequence};

    mock! {
        pub Executor {}

        #[async_trait]
        impl CommandExecutor for Executor {
            async fn execute_command(
                &self,
                command: &str,
                timeout: Option<Duration>,
            ) -> OrchestratorResult<CommandExecutionResult>;

            async fn test_connection(&self) -> OrchestratorResult<()>;
        }
    }

    fn output(text: &str, exit_code: i32) -> OrchestratorResult<CommandExecutionResult> {
        Ok(CommandExecutionResult {
            command_output: text.to_string(),
            exit_code,
        })
    }

    fn runner() -> CommandRunner {
        CommandRunner::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn runs_commands_in_order_and_chains_output() {
        let mut executor = MockExecutor::new();
        let mut seq = Sequence::new();
        executor
            .expect_execute_command()
            .withf(|command, _| command == "pgrep stress-ng")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| output("4242\n", 0));
        executor
            .expect_execute_command()
            .withf(|command, _| command == "kill -STOP 4242 --tag chaos-01")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| output("", 0));

        let commands = vec![
            CommandInfo::new("pgrep stress-ng").extract_as("pid"),
            CommandInfo::new("kill -STOP $FI_PREV --tag $FI_ARG_tag"),
        ];
        let mut args = BTreeMap::new();
        args.insert("tag".to_string(), "chaos-01".to_string());
        let mut extracted = BTreeMap::new();

        let results = runner()
            .run_all(&executor, &commands, &args, &mut extracted)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(extracted.get("pid").map(String::as_str), Some("4242"));
    }

    #[tokio::test]
    async fn extracted_values_feed_later_commands() {
        let mut executor = MockExecutor::new();
        executor
            .expect_execute_command()
            .withf(|command, _| command == "kill 77")
            .times(1)
            .returning(|_, _| output("", 0));

        let mut extracted = BTreeMap::new();
        extracted.insert("pid".to_string(), "77".to_string());

        runner()
            .run_all(
                &executor,
                &[CommandInfo::new("kill $FI_ADD_INFO_pid")],
                &BTreeMap::new(),
                &mut extracted,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failure_stops_the_remaining_commands() {
        let mut executor = MockExecutor::new();
        executor
            .expect_execute_command()
            .withf(|command, _| command == "tc qdisc add dev eth0 root netem loss 30%")
            .times(1)
            .returning(|_, _| output("RTNETLINK answers: File exists", 2));

        let commands = vec![
            CommandInfo::new("tc qdisc add dev eth0 root netem loss 30%"),
            CommandInfo::new("never runs"),
        ];

        let err = runner()
            .run_all(&executor, &commands, &BTreeMap::new(), &mut BTreeMap::new())
            .await
            .unwrap_err();

        match err {
            OrchestratorError::CommandExecution { exit_code, .. } => assert_eq!(exit_code, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn known_failure_is_reported_with_its_message() {
        let mut executor = MockExecutor::new();
        executor
            .expect_execute_command()
            .times(1)
            .returning(|_, _| output("Error: File Exists", 2));

        let info = CommandInfo::new("tc qdisc add").known_failure("file exists", "Fault already injected");
        let err = runner()
            .run(&executor, &info, &BTreeMap::new(), &mut BTreeMap::new(), None)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Fault already injected"));
    }

    #[tokio::test(start_paused = true)]
    async fn declared_retries_are_used_for_read_only_commands() {
        let mut executor = MockExecutor::new();
        let mut seq = Sequence::new();
        executor
            .expect_execute_command()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| output("starting", 0));
        executor
            .expect_execute_command()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| output("active (running)", 0));

        let info = CommandInfo::new("systemctl is-active chaos-agent")
            .expect_output("active (running)")
            .with_retries(2, 1);

        let result = runner()
            .run(&executor, &info, &BTreeMap::new(), &mut BTreeMap::new(), None)
            .await
            .unwrap();

        assert_eq!(result.command_output, "active (running)");
    }

    #[tokio::test]
    async fn commands_without_retries_run_once() {
        let mut executor = MockExecutor::new();
        executor
            .expect_execute_command()
            .times(1)
            .returning(|_, _| Err(OrchestratorError::Connectivity("connection reset".into())));

        let result = runner()
            .run(
                &executor,
                &CommandInfo::new("rm -rf /tmp/chaos"),
                &BTreeMap::new(),
                &mut BTreeMap::new(),
                None,
            )
            .await;

        assert!(matches!(result, Err(OrchestratorError::Connectivity(_))));
    }
}
