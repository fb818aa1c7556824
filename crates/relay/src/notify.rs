//! Fan-out of server-initiated notifications to every open event stream.

use serde_json::Value;
use tokio::sync::broadcast;

/// Method used when the provider connection changes state.
pub const CONNECTION_STATE: &str = "connection/state";
/// Method relayed when the provider reports its tool list changed.
pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

const NOTIFY_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

/// Cheap-to-clone handle onto the notification broadcast channel.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Notifier {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(NOTIFY_CAPACITY);
        Self { tx }
    }

    /// Publish to all current subscribers. Returns how many received it.
    pub fn publish(&self, method: impl Into<String>, params: Value) -> usize {
        let notification = Notification {
            method: method.into(),
            params,
        };
        // No subscribers is the common case when no stream is open.
        self.tx.send(notification).unwrap_or(0)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{Notifier, TOOLS_LIST_CHANGED};
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn publish_without_subscribers_is_a_noop() {
        let notifier = Notifier::new();
        assert_eq!(notifier.publish(TOOLS_LIST_CHANGED, json!({})), 0);
    }

    #[test]
    fn every_subscriber_sees_each_notification() {
        let notifier = Notifier::new();
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        assert_eq!(notifier.publish(TOOLS_LIST_CHANGED, json!({"n": 1})), 2);

        assert_eq!(a.try_recv().expect("a").params, json!({"n": 1}));
        assert_eq!(b.try_recv().expect("b").method, TOOLS_LIST_CHANGED);
        assert!(matches!(a.try_recv(), Err(TryRecvError::Empty)));
    }
}
