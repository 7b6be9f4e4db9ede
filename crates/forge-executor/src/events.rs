//! Live broadcast of timeline events.
//!
//! The timeline stored on each execution is authoritative; the bus only lets
//! observers follow it as it grows. Receivers that fall behind lose the oldest
//! events.

use forge_core::TimelineEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

/// Events buffered per receiver before the oldest are dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Fan-out of timeline events to every subscriber.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TimelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Send an event to every current subscriber and return how many got it.
    pub fn publish(&self, event: TimelineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Send events in order.
    pub fn publish_all<I>(&self, events: I)
    where
        I: IntoIterator<Item = TimelineEvent>,
    {
        for event in events {
            self.publish(event);
        }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TimelineEvent> {
        self.sender.subscribe()
    }

    /// Receive the events of one execution published from now on.
    pub fn subscribe_execution(&self, execution_id: impl Into<String>) -> ExecutionSubscription {
        ExecutionSubscription {
            execution_id: execution_id.into(),
            receiver: self.sender.subscribe(),
        }
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiver filtered to one execution.
#[derive(Debug)]
pub struct ExecutionSubscription {
    execution_id: String,
    receiver: broadcast::Receiver<TimelineEvent>,
}

impl ExecutionSubscription {
    /// Next event of the execution, `None` once the bus is gone.
    ///
    /// Lagging skips the lost events and keeps receiving.
    pub async fn recv(&mut self) -> Option<TimelineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.execution_id == self.execution_id => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(
                        "Subscriber of {} lagged, skipped {skipped} events",
                        self.execution_id
                    );
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Execution this subscription follows.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }
}
