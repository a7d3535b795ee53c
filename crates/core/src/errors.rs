use thiserror::Error;

/// 重复修复请求时返回给调用方的固定文案
pub const FAULT_ALREADY_REMEDIATED: &str = "Requested Fault is already Remediated";

/// 编排引擎错误类型定义
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("故障规格校验失败: {0}")]
    Validation(String),

    #[error("No fault found with provided ID: {id}")]
    TaskNotFound { id: String },

    #[error("Requested Fault is already Remediated. Task: {id}")]
    AlreadyRemediated { id: String },

    #[error("Fault is not in a valid state for remediation. Task: {id}, state: {state}")]
    InvalidStateForRemediation { id: String, state: String },

    #[error("未注册的任务扩展: {extension}")]
    UnsupportedExtension { extension: String },

    #[error("前置条件检查失败: {0}")]
    Prerequisite(String),

    #[error("端点连接失败: {0}")]
    Connectivity(String),

    #[error("命令执行失败: {command}, 退出码: {exit_code}, 输出: {output}")]
    CommandExecution {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("命令输出不符合预期: {command}, 期望包含 {expected:?} 之一, 实际输出: {output}")]
    UnexpectedOutput {
        command: String,
        expected: Vec<String>,
        output: String,
    },

    #[error("命令遇到已知失败: {command} - {message}")]
    KnownFailure { command: String, message: String },

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("任务存储错误: {0}")]
    Store(String),

    #[error("所有权映射错误: {0}")]
    Ownership(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("Child tasks failed for targets: {targets}")]
    ChildTasksFailed { targets: String },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("执行超时: {0}")]
    ExecutionTimeout(String),

    #[error("任务已被取消: {id}")]
    Cancelled { id: String },

    #[error("内部错误: {0}")]
    Internal(String),
}

impl OrchestratorError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn task_not_found(id: impl Into<String>) -> Self {
        Self::TaskNotFound { id: id.into() }
    }

    pub fn already_remediated(id: impl Into<String>) -> Self {
        Self::AlreadyRemediated { id: id.into() }
    }

    pub fn invalid_state_for_remediation(id: impl Into<String>, state: impl Into<String>) -> Self {
        Self::InvalidStateForRemediation {
            id: id.into(),
            state: state.into(),
        }
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    pub fn ownership(message: impl Into<String>) -> Self {
        Self::Ownership(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// 可以通过重试恢复的错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_)
                | Self::Store(_)
                | Self::Ownership(_)
                | Self::Connectivity(_)
                | Self::ExecutionTimeout(_)
        )
    }

    /// 存储或所有权映射不可用时放弃本次触发，留给下一次所有权重新评估
    pub fn abandons_trigger(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Store(_) | Self::Ownership(_))
    }

    /// 调用方请求的故障不存在、已经修复或尚不可修复
    pub fn is_remediation_rejection(&self) -> bool {
        matches!(
            self,
            Self::TaskNotFound { .. }
                | Self::AlreadyRemediated { .. }
                | Self::InvalidStateForRemediation { .. }
        )
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for OrchestratorError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("后台任务异常退出: {err}"))
    }
}
