use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, warn};

use chaos_domain::{
    CommandExecutionResult, CommandExecutor, CommandInfo, OrchestratorError, OrchestratorResult,
};

const ARG_PREFIX: &str = "$FI_ARG_";
const ADD_INFO_PREFIX: &str = "$FI_ADD_INFO_";
const PREVIOUS_OUTPUT: &str = "$FI_PREV";

/// 依次执行命令列表并校验每条命令的结果
#[derive(Debug, Clone)]
pub struct CommandRunner {
    default_retry_interval: Duration,
    command_timeout: Option<Duration>,
}

impl CommandRunner {
    pub fn new(default_retry_interval: Duration) -> Self {
        Self {
            default_retry_interval,
            command_timeout: None,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// 执行整组命令，任意一条失败即停止
    ///
    /// `extracted` 既是参数替换的来源，也接收 `extract_output_as` 提取的输出。
    pub async fn run_all(
        &self,
        executor: &dyn CommandExecutor,
        commands: &[CommandInfo],
        args: &BTreeMap<String, String>,
        extracted: &mut BTreeMap<String, String>,
    ) -> OrchestratorResult<Vec<CommandExecutionResult>> {
        let mut results: Vec<CommandExecutionResult> = Vec::with_capacity(commands.len());
        for info in commands {
            let previous = results.last().map(|r| r.command_output.as_str());
            let result = self.run(executor, info, args, extracted, previous).await?;
            results.push(result);
        }
        Ok(results)
    }

    pub async fn run(
        &self,
        executor: &dyn CommandExecutor,
        info: &CommandInfo,
        args: &BTreeMap<String, String>,
        extracted: &mut BTreeMap<String, String>,
        previous_output: Option<&str>,
    ) -> OrchestratorResult<CommandExecutionResult> {
        let command = substitute(&info.command, args, extracted, previous_output);
        let interval = info
            .retry_interval_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_retry_interval);

        let mut attempt = 0;
        let result = loop {
            let outcome = match executor.execute_command(&command, self.command_timeout).await {
                Ok(result) => verify(&command, info, result),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(result) => break result,
                Err(e) if attempt < info.no_of_retries => {
                    attempt += 1;
                    warn!(
                        "命令 {} 执行失败: {}，{:?} 后第 {}/{} 次重试",
                        command, e, interval, attempt, info.no_of_retries
                    );
                    tokio::time::sleep(interval).await;
                }
                Err(e) => return Err(e),
            }
        };

        if let Some(key) = &info.extract_output_as {
            extracted.insert(key.clone(), result.command_output.trim().to_string());
        }
        debug!("命令执行成功: {}", command);
        Ok(result)
    }
}

fn verify(
    command: &str,
    info: &CommandInfo,
    result: CommandExecutionResult,
) -> OrchestratorResult<CommandExecutionResult> {
    if !info.ignore_exit_value_check && result.exit_code != 0 {
        return Err(known_failure(command, info, &result.command_output).unwrap_or_else(|| {
            OrchestratorError::CommandExecution {
                command: command.to_string(),
                exit_code: result.exit_code,
                output: result.command_output.clone(),
            }
        }));
    }

    let expected = &info.expected_command_output_list;
    if !expected.is_empty()
        && !expected
            .iter()
            .any(|item| result.command_output.contains(item.as_str()))
    {
        return Err(known_failure(command, info, &result.command_output).unwrap_or_else(|| {
            OrchestratorError::UnexpectedOutput {
                command: command.to_string(),
                expected: expected.clone(),
                output: result.command_output.clone(),
            }
        }));
    }

    Ok(result)
}

fn known_failure(command: &str, info: &CommandInfo, output: &str) -> Option<OrchestratorError> {
    let output = output.to_lowercase();
    info.known_failure_map
        .iter()
        .find(|(pattern, _)| output.contains(&pattern.to_lowercase()))
        .map(|(_, message)| OrchestratorError::KnownFailure {
            command: command.to_string(),
            message: message.clone(),
        })
}

/// 替换命令中的参数占位符，键名长的先替换以免前缀相同的键互相覆盖
fn substitute(
    command: &str,
    args: &BTreeMap<String, String>,
    extracted: &BTreeMap<String, String>,
    previous_output: Option<&str>,
) -> String {
    let mut command = command.to_string();
    for (prefix, values) in [(ADD_INFO_PREFIX, extracted), (ARG_PREFIX, args)] {
        let mut keys: Vec<&String> = values.keys().collect();
        keys.sort_by_key(|key| std::cmp::Reverse(key.len()));
        for key in keys {
            let token = format!("{prefix}{key}");
            if command.contains(&token) {
                command = command.replace(&token, &values[key]);
            }
        }
    }
    if let Some(previous) = previous_output {
        command = command.replace(PREVIOUS_OUTPUT, previous.trim());
    }
    command
}
