//! Per-task event bus.
//!
//! The orchestrator publishes a running narration of a task's progress —
//! planning started, a step completed, a step blocked — so a caller (a CLI
//! progress bar, a streaming API response) can observe execution without
//! polling. Grounded on `wg-bastion::pipeline::stage`'s event-publication
//! idiom: a flat enum of topics plus a thin `tokio::sync::broadcast` wrapper,
//! rather than a generic pub/sub bus.

use tokio::sync::broadcast;

/// A single lifecycle event for one orchestrator task.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// The task began planning.
    Started {
        /// Id of the task.
        task_id: String,
    },
    /// The planner produced a plan.
    Planned {
        /// Id of the task.
        task_id: String,
        /// Number of steps in the plan.
        step_count: usize,
    },
    /// A step began executing.
    StepStarted {
        /// Id of the task.
        task_id: String,
        /// Id of the step.
        step_id: String,
    },
    /// A step completed successfully.
    StepCompleted {
        /// Id of the task.
        task_id: String,
        /// Id of the step.
        step_id: String,
    },
    /// A step was blocked by a security or policy check.
    StepBlocked {
        /// Id of the task.
        task_id: String,
        /// Id of the step.
        step_id: String,
        /// Why the step was blocked.
        reason: String,
    },
    /// The task is paused pending human approval.
    AwaitingApproval {
        /// Id of the task.
        task_id: String,
        /// Id of the approval request.
        approval_id: String,
    },
    /// The task completed, successfully or not.
    Completed {
        /// Id of the task.
        task_id: String,
        /// Final status, rendered as a lowercase string (`"completed"`,
        /// `"blocked"`, `"error"`).
        status: String,
    },
    /// The task failed with a non-security error.
    Error {
        /// Id of the task.
        task_id: String,
        /// Error detail.
        reason: String,
    },
}

impl TaskEvent {
    /// The task id this event pertains to, regardless of variant.
    #[must_use]
    pub fn task_id(&self) -> &str {
        match self {
            Self::Started { task_id }
            | Self::Planned { task_id, .. }
            | Self::StepStarted { task_id, .. }
            | Self::StepCompleted { task_id, .. }
            | Self::StepBlocked { task_id, .. }
            | Self::AwaitingApproval { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::Error { task_id, .. } => task_id,
        }
    }
}

/// Default channel capacity: enough to hold every event of a typical plan
/// (a handful of steps) without a slow subscriber forcing the publisher to
/// block; `broadcast` drops the oldest event on overflow rather than
/// blocking, which is the right tradeoff for a progress feed.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Broadcasts [`TaskEvent`]s to any number of subscribers. One bus instance
/// is shared across all tasks; subscribers filter by task id themselves,
/// since `tokio::sync::broadcast` has no built-in topic routing.
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    /// Construct a bus with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Silently dropped if there are no subscribers —
    /// mirrors `broadcast::Sender::send`'s "no receivers" error, which is
    /// not a failure condition for a best-effort progress feed.
    pub fn publish(&self, event: TaskEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to every event published from this point forward.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(TaskEvent::Started {
            task_id: "t1".to_string(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id(), "t1");
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(TaskEvent::Started {
            task_id: "t1".to_string(),
        });
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_events() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        bus.publish(TaskEvent::Completed {
            task_id: "t2".to_string(),
            status: "completed".to_string(),
        });
        assert_eq!(rx1.recv().await.unwrap().task_id(), "t2");
        assert_eq!(rx2.recv().await.unwrap().task_id(), "t2");
    }
}
