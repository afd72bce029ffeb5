use crate::types::EngineEvent;

/// Broadcast bus for the events of one conversation.
/// Every subscriber sees every event published after it subscribed.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(EngineEvent::Reset { session_id: None });
        assert_eq!(a.recv().await.unwrap().name(), "reset");
        assert_eq!(b.recv().await.unwrap().name(), "reset");
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::new(4).publish(EngineEvent::Reset { session_id: None });
    }
}
