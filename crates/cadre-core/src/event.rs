use tokio::sync::broadcast;

use crate::types::GraphEvent;

/// Fan-out of run events to any number of observers.
///
/// Publishing never blocks a run. An observer that falls more than the bus
/// capacity behind skips the oldest events and sees `RecvError::Lagged`.
pub struct EventBus {
    tx: broadcast::Sender<GraphEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver `event` to every current subscriber and return how many there
    /// were. With nobody listening the event is dropped.
    pub fn publish(&self, event: GraphEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<GraphEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
