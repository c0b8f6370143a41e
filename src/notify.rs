use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub of committed events per class session. Callers turned away
/// with `CapacityExceeded` subscribe here to learn when a seat frees up.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a session. Creates the channel if needed.
    pub fn subscribe(&self, session_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, session_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&session_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop channels nobody listens to anymore.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let sid = Ulid::new();
        let mut rx = hub.subscribe(sid);

        let event = Event::RegistrationCancelled {
            id: Ulid::new(),
            session_id: sid,
        };
        hub.send(sid, &event);

        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let sid = Ulid::new();
        hub.send(
            sid,
            &Event::RegistrationCancelled {
                id: Ulid::new(),
                session_id: sid,
            },
        );
    }

    #[tokio::test]
    async fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let kept = Ulid::new();
        let _rx = hub.subscribe(kept);
        drop(hub.subscribe(Ulid::new()));

        hub.prune();
        assert_eq!(hub.channels.len(), 1);
        assert!(hub.channels.contains_key(&kept));
    }
}
