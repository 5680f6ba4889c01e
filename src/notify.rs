use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;

/// Who a notification is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipient {
    Customer(Ulid),
    /// The management desk of a branch.
    BranchManagement(Ulid),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[default]
    Email,
    Sms,
    Push,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub priority: Priority,
    pub subject: String,
    pub payload: serde_json::Value,
}

/// What a subscriber of the hub receives.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub channel: Channel,
    pub notification: Notification,
}

/// Outbound notification sink. Fire-and-forget: the engine never observes delivery,
/// and only calls `send` after the owning transaction has committed.
pub trait NotificationDispatcher: Send + Sync {
    fn send(&self, recipient: Recipient, channel: Channel, message: Notification);
}

/// Broadcast hub: one channel per recipient, created on first subscribe.
pub struct NotifyHub {
    channels: DashMap<Recipient, broadcast::Sender<Delivery>>,
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

    /// Subscribe to notifications for a recipient. Creates the channel if needed.
    pub fn subscribe(&self, recipient: Recipient) -> broadcast::Receiver<Delivery> {
        let sender = self
            .channels
            .entry(recipient)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn remove(&self, recipient: &Recipient) {
        self.channels.remove(recipient);
    }
}

impl NotificationDispatcher for NotifyHub {
    /// No-op if nobody is listening.
    fn send(&self, recipient: Recipient, channel: Channel, message: Notification) {
        metrics::counter!(crate::observability::NOTIFICATIONS_SENT_TOTAL).increment(1);
        if let Some(sender) = self.channels.get(&recipient) {
            let _ = sender.send(Delivery {
                channel,
                notification: message,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(subject: &str) -> Notification {
        Notification {
            priority: Priority::Normal,
            subject: subject.into(),
            payload: serde_json::json!({ "k": 1 }),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let who = Recipient::Customer(Ulid::new());
        let mut rx = hub.subscribe(who);

        hub.send(who, Channel::Sms, message("moved"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.channel, Channel::Sms);
        assert_eq!(received.notification.subject, "moved");
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        // Nobody listening; send is a no-op.
        hub.send(
            Recipient::BranchManagement(Ulid::new()),
            Channel::Email,
            message("nobody"),
        );
    }

    #[tokio::test]
    async fn recipients_are_isolated() {
        let hub = NotifyHub::new();
        let a = Recipient::Customer(Ulid::new());
        let b = Recipient::Customer(Ulid::new());
        let mut rx_a = hub.subscribe(a);
        let mut rx_b = hub.subscribe(b);

        hub.send(b, Channel::Email, message("for b"));

        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap().notification.subject, "for b");
    }
}
