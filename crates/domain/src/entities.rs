use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use chaos_core::{OrchestratorError, OrchestratorResult};

use crate::value_objects::{ScheduleStatus, StageState, SubStage, TaskStatus, TaskType};

pub type TaskId = String;

/// 故障作用的物理目标，例如某个 Pod 或某个端点
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetRef {
    pub kind: String,
    pub id: String,
}

impl TargetRef {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.id)
    }
}

/// 调度定义，CRON 与一次性定时二选一
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    #[serde(default)]
    pub cron_expression: Option<String>,
    /// 一次性执行的时间点（Unix 毫秒）
    #[serde(default)]
    pub time_in_milliseconds: Option<i64>,
    #[serde(default)]
    pub description: Option<String>,
}

impl ScheduleSpec {
    pub fn cron(expression: impl Into<String>) -> Self {
        Self {
            cron_expression: Some(expression.into()),
            time_in_milliseconds: None,
            description: None,
        }
    }

    pub fn at(time_in_milliseconds: i64) -> Self {
        Self {
            cron_expression: None,
            time_in_milliseconds: Some(time_in_milliseconds),
            description: None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.cron_expression.is_some()
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        match (&self.cron_expression, self.time_in_milliseconds) {
            (Some(expr), None) => cron::Schedule::from_str(expr)
                .map(|_| ())
                .map_err(|e| OrchestratorError::InvalidCron {
                    expr: expr.clone(),
                    message: e.to_string(),
                }),
            (None, Some(millis)) if millis > 0 => Ok(()),
            _ => Err(OrchestratorError::validation(
                "调度必须且只能指定 cron_expression 或 time_in_milliseconds 之一",
            )),
        }
    }
}

/// 由命令构建器生成、由命令执行器逐条执行的命令描述
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub command: String,
    #[serde(default)]
    pub ignore_exit_value_check: bool,
    /// 输出必须包含其中之一，为空时不检查
    #[serde(default)]
    pub expected_command_output_list: Vec<String>,
    /// 输出片段（大小写不敏感）到已知错误描述的映射
    #[serde(default)]
    pub known_failure_map: BTreeMap<String, String>,
    /// 只读命令才会声明重试
    #[serde(default)]
    pub no_of_retries: u32,
    #[serde(default)]
    pub retry_interval_seconds: Option<u64>,
    /// 把输出保存到排障信息中的键名
    #[serde(default)]
    pub extract_output_as: Option<String>,
}

impl CommandInfo {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn expect_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_command_output_list.push(expected.into());
        self
    }

    pub fn known_failure(mut self, pattern: impl Into<String>, message: impl Into<String>) -> Self {
        self.known_failure_map.insert(pattern.into(), message.into());
        self
    }

    pub fn with_retries(mut self, retries: u32, interval_seconds: u64) -> Self {
        self.no_of_retries = retries;
        self.retry_interval_seconds = Some(interval_seconds);
        self
    }

    pub fn ignore_exit_value(mut self) -> Self {
        self.ignore_exit_value_check = true;
        self
    }

    pub fn extract_as(mut self, key: impl Into<String>) -> Self {
        self.extract_output_as = Some(key.into());
        self
    }
}

/// 提交时给出的故障规格，创建后除附加命令列表外不再修改
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultSpec {
    pub fault_name: String,
    /// 负责执行该任务的扩展名称
    pub extension_name: String,
    pub endpoint_name: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    #[serde(default)]
    pub long_lasting: bool,
    #[serde(default)]
    pub timeout_in_milliseconds: Option<u64>,
    #[serde(default)]
    pub targets: Vec<TargetRef>,
    #[serde(default)]
    pub random_injection: bool,
    /// 扇出父任务为每个目标创建子任务时使用的扩展
    #[serde(default)]
    pub child_extension_name: Option<String>,
    #[serde(default)]
    pub schedule: Option<ScheduleSpec>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub injection_commands: Vec<CommandInfo>,
    #[serde(default)]
    pub remediation_commands: Vec<CommandInfo>,
}

impl FaultSpec {
    pub fn new(
        fault_name: impl Into<String>,
        extension_name: impl Into<String>,
        endpoint_name: impl Into<String>,
    ) -> Self {
        Self {
            fault_name: fault_name.into(),
            extension_name: extension_name.into(),
            endpoint_name: endpoint_name.into(),
            args: BTreeMap::new(),
            long_lasting: false,
            timeout_in_milliseconds: None,
            targets: Vec::new(),
            random_injection: false,
            child_extension_name: None,
            schedule: None,
            tags: BTreeMap::new(),
            injection_commands: Vec::new(),
            remediation_commands: Vec::new(),
        }
    }

    /// 注入后保持 IN_PROGRESS，超时后自动修复
    pub fn is_timed(&self) -> bool {
        self.long_lasting && self.timeout_in_milliseconds.is_some()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_in_milliseconds.map(Duration::from_millis)
    }

    pub fn has_commands(&self) -> bool {
        !self.injection_commands.is_empty() || !self.remediation_commands.is_empty()
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.fault_name.trim().is_empty() {
            return Err(OrchestratorError::validation("故障名称不能为空"));
        }
        if self.extension_name.trim().is_empty() {
            return Err(OrchestratorError::validation("扩展名称不能为空"));
        }
        if self.endpoint_name.trim().is_empty() {
            return Err(OrchestratorError::validation("端点名称不能为空"));
        }
        if self.timeout_in_milliseconds == Some(0) {
            return Err(OrchestratorError::validation("超时时间必须大于0"));
        }
        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }
        Ok(())
    }

    /// 扇出时为单个目标派生的子规格
    pub fn for_target(&self, target: &TargetRef, extension_name: &str) -> FaultSpec {
        let mut child = self.clone();
        child.extension_name = extension_name.to_string();
        child.targets = vec![target.clone()];
        child.random_injection = false;
        child.child_extension_name = None;
        child.schedule = None;
        child
            .args
            .insert("targetKind".to_string(), target.kind.clone());
        child.args.insert("targetId".to_string(), target.id.clone());
        child
    }
}

/// 一次执行尝试
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTrigger {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub task_status: TaskStatus,
    pub current_stage: Option<SubStage>,
    pub stage_state: Option<StageState>,
    pub task_output: Option<String>,
    pub task_failure_reason: Option<String>,
    pub child_task_ids: Vec<TaskId>,
    /// 子任务ID到其目标的映射
    pub child_targets: BTreeMap<TaskId, TargetRef>,
    /// 驱动本次触发的节点
    pub node: Option<String>,
    pub is_trigger_metric_collected: bool,
}

impl TaskTrigger {
    pub fn started(node_id: &str) -> Self {
        Self {
            start_time: Some(Utc::now()),
            task_status: TaskStatus::InProgress,
            node: Some(node_id.to_string()),
            ..Default::default()
        }
    }

    pub fn append_output(&mut self, line: &str) {
        append_line(&mut self.task_output, line);
    }

    pub fn append_failure_reason(&mut self, reason: &str) {
        append_line(&mut self.task_failure_reason, reason);
    }

    pub fn record_child(&mut self, target: TargetRef, child_id: TaskId) {
        self.child_task_ids.push(child_id.clone());
        self.child_targets.insert(child_id, target);
    }
}

fn append_line(field: &mut Option<String>, line: &str) {
    match field {
        Some(existing) if !existing.is_empty() => {
            existing.push('\n');
            existing.push_str(line);
        }
        _ => *field = Some(line.to_string()),
    }
}

/// 一个逻辑故障任务
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_name: String,
    pub task_description: String,
    pub task_type: TaskType,
    pub extension_name: String,
    pub is_scheduled_task: bool,
    pub schedule_status: Option<ScheduleStatus>,
    /// 触发历史，最后一个为当前活动触发
    pub triggers: Vec<TaskTrigger>,
    pub task_data: FaultSpec,
    /// 修复任务指向被修复的注入任务
    pub injection_task_id: Option<TaskId>,
    pub parent_task_id: Option<TaskId>,
    pub remediated: bool,
    /// 注入任务上记录当前负责修复它的任务
    #[serde(default)]
    pub remediation_task_id: Option<TaskId>,
    pub troubleshooting_info: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(task_type: TaskType, task_data: FaultSpec) -> Self {
        let is_scheduled_task = task_data.schedule.is_some();
        Self {
            id: Uuid::new_v4().to_string(),
            task_name: task_data.fault_name.clone(),
            task_description: String::new(),
            task_type,
            extension_name: task_data.extension_name.clone(),
            is_scheduled_task,
            schedule_status: is_scheduled_task.then_some(ScheduleStatus::Scheduled),
            triggers: Vec::new(),
            task_data,
            injection_task_id: None,
            parent_task_id: None,
            remediated: false,
            remediation_task_id: None,
            troubleshooting_info: BTreeMap::new(),
            created_at: Utc::now(),
            last_updated: None,
        }
    }

    /// 针对一个注入任务创建修复任务
    pub fn remediation_of(injection: &Task) -> Self {
        let mut task_data = injection.task_data.clone();
        task_data.schedule = None;
        let mut task = Task::new(TaskType::Remediation, task_data);
        task.task_name = format!("{}-remediation", injection.task_name);
        task.injection_task_id = Some(injection.id.clone());
        task.parent_task_id = injection.parent_task_id.clone();
        task
    }

    /// 扇出父任务为单个目标创建的子任务
    pub fn child_of(parent: &Task, target: &TargetRef, extension_name: &str) -> Self {
        let mut task = Task::new(
            TaskType::Injection,
            parent.task_data.for_target(target, extension_name),
        );
        task.task_name = format!("{}-{}", parent.task_name, target.id);
        task.parent_task_id = Some(parent.id.clone());
        task
    }

    pub fn active_trigger(&self) -> Option<&TaskTrigger> {
        self.triggers.last()
    }

    pub fn active_trigger_mut(&mut self) -> Option<&mut TaskTrigger> {
        self.triggers.last_mut()
    }

    /// 压入新的触发记录，旧记录保持不变
    pub fn start_new_trigger(&mut self, node_id: &str) -> &mut TaskTrigger {
        self.triggers.push(TaskTrigger::started(node_id));
        let last = self.triggers.len() - 1;
        &mut self.triggers[last]
    }

    pub fn status(&self) -> TaskStatus {
        self.active_trigger()
            .map(|trigger| trigger.task_status)
            .unwrap_or_default()
    }

    pub fn output(&self) -> Option<&str> {
        self.active_trigger()
            .and_then(|trigger| trigger.task_output.as_deref())
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.active_trigger()
            .and_then(|trigger| trigger.task_failure_reason.as_deref())
    }

    pub fn current_stage(&self) -> Option<SubStage> {
        self.active_trigger().and_then(|trigger| trigger.current_stage)
    }

    pub fn stage_state(&self) -> Option<StageState> {
        self.active_trigger().and_then(|trigger| trigger.stage_state)
    }

    pub fn child_task_ids(&self) -> &[TaskId] {
        self.active_trigger()
            .map(|trigger| trigger.child_task_ids.as_slice())
            .unwrap_or(&[])
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        if let Some(trigger) = self.active_trigger_mut() {
            trigger.task_status = status;
            if status.is_terminal() {
                trigger.end_time = Some(Utc::now());
            }
        }
    }

    pub fn append_output(&mut self, line: &str) {
        if let Some(trigger) = self.active_trigger_mut() {
            trigger.append_output(line);
        }
    }

    pub fn append_failure_reason(&mut self, reason: &str) {
        if let Some(trigger) = self.active_trigger_mut() {
            trigger.append_failure_reason(reason);
        }
    }

    pub fn set_substage(&mut self, stage: SubStage, state: StageState) {
        if let Some(trigger) = self.active_trigger_mut() {
            trigger.current_stage = Some(stage);
            trigger.stage_state = Some(state);
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn is_active_schedule(&self) -> bool {
        self.is_scheduled_task
            && self
                .schedule_status
                .map(|status| status.is_active())
                .unwrap_or(false)
    }

    /// 只有单目标注入自己等待超时，扇出父任务等待子任务各自的定时修复
    pub fn is_timed_fault(&self) -> bool {
        self.task_type == TaskType::Injection && self.task_data.is_timed()
    }

    /// 注入任务当前能否接受修复请求
    ///
    /// 一次性故障要求注入已经 COMPLETED；定时故障要求注入子阶段已完成、正在等待超时；
    /// 定时扇出父任务在子任务创建后即可修复，由各子任务自行判断。
    pub fn is_ready_for_remediation(&self) -> bool {
        match self.status() {
            TaskStatus::Completed => !self.is_timed_fault(),
            TaskStatus::InProgress if self.is_timed_fault() => {
                self.current_stage() == Some(SubStage::TriggerInjection)
                    && self.stage_state() == Some(StageState::Completed)
            }
            TaskStatus::InProgress => {
                self.task_type == TaskType::Trigger
                    && self.task_data.is_timed()
                    && !self.child_task_ids().is_empty()
            }
            _ => false,
        }
    }

    /// 不可修复时返回的错误
    pub fn ensure_ready_for_remediation(&self) -> OrchestratorResult<()> {
        if self.is_ready_for_remediation() {
            return Ok(());
        }
        let state = match (self.current_stage(), self.stage_state()) {
            (Some(stage), Some(stage_state)) => {
                format!("{}/{}/{:?}", self.status(), stage, stage_state)
            }
            _ => self.status().to_string(),
        };
        Err(OrchestratorError::invalid_state_for_remediation(&self.id, state))
    }

    /// 持久化前刷新 `last_updated`，保证严格递增
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.last_updated = Some(match self.last_updated {
            Some(previous) if now <= previous => previous + chrono::Duration::milliseconds(1),
            _ => now,
        });
    }
}

/// 任务查询过滤条件
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub endpoint_name: Option<String>,
    pub updated_after: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(status) = self.status {
            if task.status() != status {
                return false;
            }
        }
        if let Some(task_type) = self.task_type {
            if task.task_type != task_type {
                return false;
            }
        }
        if let Some(endpoint_name) = &self.endpoint_name {
            if &task.task_data.endpoint_name != endpoint_name {
                return false;
            }
        }
        let updated = task.last_updated.unwrap_or(task.created_at);
        if let Some(after) = self.updated_after {
            if updated < after {
                return false;
            }
        }
        if let Some(before) = self.updated_before {
            if updated > before {
                return false;
            }
        }
        true
    }
}
