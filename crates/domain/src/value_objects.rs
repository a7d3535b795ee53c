//! 值对象
//!
//! 任务状态、任务类型与子阶段等枚举，序列化为与持久化层一致的大写字符串

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use chaos_core::OrchestratorError;

/// 单次触发的任务状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Initializing,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Initializing => "INITIALIZING",
            TaskStatus::InProgress => "IN_PROGRESS",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIALIZING" => Ok(TaskStatus::Initializing),
            "IN_PROGRESS" => Ok(TaskStatus::InProgress),
            "COMPLETED" => Ok(TaskStatus::Completed),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(OrchestratorError::Serialization(format!(
                "未知的任务状态: {other}"
            ))),
        }
    }
}

/// 任务类型，`Trigger` 为扇出到多个子任务的父任务
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Injection,
    Remediation,
    ResiliencyScore,
    Trigger,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Injection => "INJECTION",
            TaskType::Remediation => "REMEDIATION",
            TaskType::ResiliencyScore => "RESILIENCY_SCORE",
            TaskType::Trigger => "TRIGGER",
        }
    }

    /// 可以被修复的任务类型
    pub fn is_remediable(&self) -> bool {
        matches!(self, TaskType::Injection | TaskType::Trigger)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INJECTION" => Ok(TaskType::Injection),
            "REMEDIATION" => Ok(TaskType::Remediation),
            "RESILIENCY_SCORE" => Ok(TaskType::ResiliencyScore),
            "TRIGGER" => Ok(TaskType::Trigger),
            other => Err(OrchestratorError::Serialization(format!(
                "未知的任务类型: {other}"
            ))),
        }
    }
}

/// IN_PROGRESS 状态下的有序子阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubStage {
    PrerequisitesCheck,
    PrepareTargetMachine,
    TriggerInjection,
    RemediationPrerequisitesCheck,
    TriggerRemediation,
}

impl SubStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubStage::PrerequisitesCheck => "PREREQUISITES_CHECK",
            SubStage::PrepareTargetMachine => "PREPARE_TARGET_MACHINE",
            SubStage::TriggerInjection => "TRIGGER_INJECTION",
            SubStage::RemediationPrerequisitesCheck => "REMEDIATION_PREREQUISITES_CHECK",
            SubStage::TriggerRemediation => "TRIGGER_REMEDIATION",
        }
    }

    /// 该阶段是否会对目标产生外部副作用
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self,
            SubStage::PrepareTargetMachine
                | SubStage::TriggerInjection
                | SubStage::TriggerRemediation
        )
    }
}

impl fmt::Display for SubStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 当前子阶段是刚开始还是已经完成
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageState {
    Started,
    Completed,
}

/// 周期调度状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleStatus {
    Scheduled,
    Paused,
    Cancelled,
    Finished,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Scheduled => "SCHEDULED",
            ScheduleStatus::Paused => "PAUSED",
            ScheduleStatus::Cancelled => "CANCELLED",
            ScheduleStatus::Finished => "FINISHED",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ScheduleStatus::Scheduled)
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SCHEDULED" => Ok(ScheduleStatus::Scheduled),
            "PAUSED" => Ok(ScheduleStatus::Paused),
            "CANCELLED" => Ok(ScheduleStatus::Cancelled),
            "FINISHED" => Ok(ScheduleStatus::Finished),
            other => Err(OrchestratorError::Serialization(format!(
                "未知的调度状态: {other}"
            ))),
        }
    }
}
