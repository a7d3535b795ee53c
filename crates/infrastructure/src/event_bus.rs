use tokio::sync::broadcast;
use tracing::trace;

use chaos_domain::events::{
    TaskCompletedEvent, TaskCreatedEvent, TaskEventPublisher, TaskModifiedEvent,
    TaskSubstageEvent,
};

/// 按事件类型划分的广播通道
///
/// 订阅者在启动时通过 `subscribe_*` 注册；没有订阅者时事件直接丢弃。
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    created: broadcast::Sender<TaskCreatedEvent>,
    modified: broadcast::Sender<TaskModifiedEvent>,
    substage: broadcast::Sender<TaskSubstageEvent>,
    completed: broadcast::Sender<TaskCompletedEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            created: broadcast::channel(capacity).0,
            modified: broadcast::channel(capacity).0,
            substage: broadcast::channel(capacity).0,
            completed: broadcast::channel(capacity).0,
        }
    }

    pub fn subscribe_created(&self) -> broadcast::Receiver<TaskCreatedEvent> {
        self.created.subscribe()
    }

    pub fn subscribe_modified(&self) -> broadcast::Receiver<TaskModifiedEvent> {
        self.modified.subscribe()
    }

    pub fn subscribe_substage(&self) -> broadcast::Receiver<TaskSubstageEvent> {
        self.substage.subscribe()
    }

    pub fn subscribe_completed(&self) -> broadcast::Receiver<TaskCompletedEvent> {
        self.completed.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl TaskEventPublisher for BroadcastEventBus {
    fn task_created(&self, event: TaskCreatedEvent) {
        if self.created.send(event).is_err() {
            trace!("TaskCreated 事件没有订阅者");
        }
    }

    fn task_modified(&self, event: TaskModifiedEvent) {
        if self.modified.send(event).is_err() {
            trace!("TaskModified 事件没有订阅者");
        }
    }

    fn task_substage_changed(&self, event: TaskSubstageEvent) {
        if self.substage.send(event).is_err() {
            trace!("TaskSubstageChanged 事件没有订阅者");
        }
    }

    fn task_completed(&self, event: TaskCompletedEvent) {
        if self.completed.send(event).is_err() {
            trace!("TaskCompleted 事件没有订阅者");
        }
    }
}
