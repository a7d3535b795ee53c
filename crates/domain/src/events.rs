//! 领域事件
//!
//! 每种事件一个独立类型，由发布者按类型分发到各自的订阅通道

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::entities::{Task, TaskId};
use crate::value_objects::{StageState, SubStage, TaskStatus};

/// 领域事件基础trait
pub trait DomainEvent: Send + Sync {
    fn event_id(&self) -> Uuid;
    fn event_type(&self) -> &str;
    fn occurred_at(&self) -> DateTime<Utc>;
    fn aggregate_id(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct TaskCreatedEvent {
    pub id: Uuid,
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub occurred_at: DateTime<Utc>,
}

impl TaskCreatedEvent {
    pub fn new(task: &Task) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task.id.clone(),
            status: task.status(),
            occurred_at: Utc::now(),
        }
    }
}

/// 任务记录发生变化后的快照
#[derive(Debug, Clone)]
pub struct TaskModifiedEvent {
    pub id: Uuid,
    pub task: Task,
    pub occurred_at: DateTime<Utc>,
}

impl TaskModifiedEvent {
    pub fn new(task: &Task) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: task.clone(),
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskSubstageEvent {
    pub id: Uuid,
    pub task_id: TaskId,
    pub stage: SubStage,
    pub state: StageState,
    pub occurred_at: DateTime<Utc>,
}

impl TaskSubstageEvent {
    pub fn new(task_id: &str, stage: SubStage, state: StageState) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.to_string(),
            stage,
            state,
            occurred_at: Utc::now(),
        }
    }
}

/// 活动触发进入终态
#[derive(Debug, Clone)]
pub struct TaskCompletedEvent {
    pub id: Uuid,
    pub task: Task,
    pub occurred_at: DateTime<Utc>,
}

impl TaskCompletedEvent {
    pub fn new(task: &Task) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: task.clone(),
            occurred_at: Utc::now(),
        }
    }
}

macro_rules! impl_domain_event {
    ($ty:ty, $name:literal, |$e:ident| $aggregate:expr) => {
        impl DomainEvent for $ty {
            fn event_id(&self) -> Uuid {
                self.id
            }

            fn event_type(&self) -> &str {
                $name
            }

            fn occurred_at(&self) -> DateTime<Utc> {
                self.occurred_at
            }

            fn aggregate_id(&self) -> String {
                let $e = self;
                $aggregate
            }
        }
    };
}

impl_domain_event!(TaskCreatedEvent, "TaskCreated", |e| e.task_id.clone());
impl_domain_event!(TaskModifiedEvent, "TaskModified", |e| e.task.id.clone());
impl_domain_event!(TaskSubstageEvent, "TaskSubstageChanged", |e| e.task_id.clone());
impl_domain_event!(TaskCompletedEvent, "TaskCompleted", |e| e.task.id.clone());

/// 任务事件发布接口
///
/// 发布是即发即弃的，订阅者的失败不会影响任务结果
pub trait TaskEventPublisher: Send + Sync {
    fn task_created(&self, event: TaskCreatedEvent);
    fn task_modified(&self, event: TaskModifiedEvent);
    fn task_substage_changed(&self, event: TaskSubstageEvent);
    fn task_completed(&self, event: TaskCompletedEvent);
}
