use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub delivering admission and transfer events per user.
///
/// The external notification collaborator subscribes here and turns events
/// into user-facing messages; nothing in this crate formats or sends them.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a user's events. Creates the channel if needed.
    pub fn subscribe(&self, user: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(user)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send an event to one user. No-op if nobody is listening.
    pub fn send_to(&self, user: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&user) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a user's channel (e.g. on account deletion).
    pub fn remove(&self, user: &Ulid) {
        self.channels.remove(user);
    }
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Day;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let user = Ulid::new();
        let mut rx = hub.subscribe(user);

        let event = Event::ReservationAdmitted {
            reservation_id: Ulid::new(),
            user_id: user,
            day: Day(19_000),
            remaining_spots: 3,
        };
        hub.send_to(user, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let user = Ulid::new();
        // No subscriber — should not panic
        hub.send_to(
            user,
            &Event::ReservationCancelled {
                reservation_id: Ulid::new(),
                user_id: user,
                day: Day(1),
            },
        );
    }

    #[tokio::test]
    async fn events_are_per_user() {
        let hub = NotifyHub::new();
        let alice = Ulid::new();
        let bob = Ulid::new();
        let mut alice_rx = hub.subscribe(alice);
        let mut bob_rx = hub.subscribe(bob);

        let event = Event::TransferCreated {
            transfer_id: Ulid::new(),
            reservation_id: Ulid::new(),
            initiator_id: alice,
            target_user_id: bob,
        };
        hub.send_to(bob, &event);

        assert_eq!(bob_rx.recv().await.unwrap(), event);
        assert!(alice_rx.try_recv().is_err());
    }
}
