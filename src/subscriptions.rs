//! Subscription registry and live-event fan-out. Records are keyed by
//! `(connection id, subscription id)`; each connection registers its
//! outbound frame queue here so a broadcast can enqueue directly.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use tokio::sync::{mpsc, Notify, RwLock};

use crate::event::Event;
use crate::filter::{matches_any, Filter};
use crate::message::RelayMessage;

pub type ConnId = String;

struct ConnEntry {
    sender: mpsc::Sender<Message>,
    disconnect: Arc<Notify>,
    disconnect_reason: std::sync::Mutex<Option<String>>,
    subs: HashMap<String, Vec<Filter>>,
}

pub struct SubscriptionManager {
    max_subscriptions: usize,
    max_filters: usize,
    inner: RwLock<HashMap<ConnId, ConnEntry>>,
}

impl SubscriptionManager {
    pub fn new(max_subscriptions: usize, max_filters: usize) -> Self {
        Self {
            max_subscriptions,
            max_filters,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Called on WebSocket upgrade. `disconnect` is notified when the
    /// manager decides the connection must go (backpressure overflow).
    pub async fn register(
        &self,
        conn_id: &str,
        sender: mpsc::Sender<Message>,
        disconnect: Arc<Notify>,
    ) {
        let mut inner = self.inner.write().await;
        inner.insert(
            conn_id.to_string(),
            ConnEntry {
                sender,
                disconnect,
                disconnect_reason: std::sync::Mutex::new(None),
                subs: HashMap::new(),
            },
        );
    }

    /// Drops the connection's subscriptions and queue handle.
    pub async fn unregister(&self, conn_id: &str) {
        self.inner.write().await.remove(conn_id);
    }

    /// Why the manager disconnected this connection, if it did.
    pub async fn take_disconnect_reason(&self, conn_id: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner
            .get(conn_id)
            .and_then(|e| e.disconnect_reason.lock().ok().and_then(|mut r| r.take()))
    }

    /// Cap check for a prospective REQ. Re-using an existing sub id is a
    /// replacement, not a new subscription.
    pub async fn check_caps(
        &self,
        conn_id: &str,
        sub_id: &str,
        filter_count: usize,
    ) -> Result<(), String> {
        if filter_count > self.max_filters {
            return Err(format!(
                "invalid: too many filters (max {})",
                self.max_filters
            ));
        }
        let inner = self.inner.read().await;
        if let Some(entry) = inner.get(conn_id) {
            if entry.subs.len() >= self.max_subscriptions && !entry.subs.contains_key(sub_id) {
                return Err(format!(
                    "invalid: too many subscriptions (max {})",
                    self.max_subscriptions
                ));
            }
        }
        Ok(())
    }

    /// Register a live subscription. The caller has already streamed the
    /// stored history and EOSE, so everything delivered from here on is
    /// strictly post-EOSE.
    pub async fn open(&self, conn_id: &str, sub_id: &str, filters: Vec<Filter>) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.get_mut(conn_id) {
            entry.subs.insert(sub_id.to_string(), filters);
        }
    }

    /// Returns true when the subscription existed.
    pub async fn close(&self, conn_id: &str, sub_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner
            .get_mut(conn_id)
            .map(|entry| entry.subs.remove(sub_id).is_some())
            .unwrap_or(false)
    }

    pub async fn subscription_count(&self, conn_id: &str) -> usize {
        let inner = self.inner.read().await;
        inner.get(conn_id).map(|e| e.subs.len()).unwrap_or(0)
    }

    /// Fan a freshly admitted event out to every matching subscription on
    /// every connection. Best-effort: a connection whose outbound queue is
    /// full is disconnected rather than awaited. Returns the number of
    /// frames enqueued.
    pub async fn broadcast(&self, event: &Event) -> usize {
        let mut delivered = 0;
        let mut overflowed: Vec<ConnId> = Vec::new();
        {
            let inner = self.inner.read().await;
            for (conn_id, entry) in inner.iter() {
                for (sub_id, filters) in &entry.subs {
                    if !matches_any(event, filters) {
                        continue;
                    }
                    let frame =
                        Message::Text(RelayMessage::event(sub_id.clone(), event.clone()).as_json());
                    match entry.sender.try_send(frame) {
                        Ok(()) => delivered += 1,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            // Best-effort CLOSED; the queue is already full
                            // so this usually goes nowhere.
                            let closed = Message::Text(
                                RelayMessage::closed(sub_id.clone(), "rate-limited: backpressure")
                                    .as_json(),
                            );
                            let _ = entry.sender.try_send(closed);
                            if let Ok(mut reason) = entry.disconnect_reason.lock() {
                                reason.get_or_insert_with(|| {
                                    "rate-limited: backpressure".to_string()
                                });
                            }
                            entry.disconnect.notify_one();
                            overflowed.push(conn_id.clone());
                            break;
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
            }
        }
        if !overflowed.is_empty() {
            let mut inner = self.inner.write().await;
            for conn_id in &overflowed {
                if let Some(entry) = inner.get_mut(conn_id) {
                    entry.subs.clear();
                }
            }
            tracing::warn!(
                connections = overflowed.len(),
                "disconnecting backpressured connections"
            );
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{keypair, sign_event};

    fn text_of(msg: &Message) -> &str {
        match msg {
            Message::Text(t) => t,
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_matching_subscriptions_only() {
        let mgr = SubscriptionManager::new(16, 8);
        let (tx, mut rx) = mpsc::channel(8);
        mgr.register("conn1", tx, Arc::new(Notify::new())).await;

        let mut kind1 = Filter::new();
        kind1.kinds = Some(vec![1]);
        let mut kind7 = Filter::new();
        kind7.kinds = Some(vec![7]);
        mgr.open("conn1", "notes", vec![kind1]).await;
        mgr.open("conn1", "reactions", vec![kind7]).await;

        let event = sign_event(&keypair(), 1, vec![], "hello", 100);
        let delivered = mgr.broadcast(&event).await;
        assert_eq!(delivered, 1);

        let frame = rx.recv().await.expect("frame");
        let text = text_of(&frame).to_string();
        assert!(text.starts_with(r#"["EVENT","notes""#));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn each_matching_subscription_gets_its_own_frame() {
        let mgr = SubscriptionManager::new(16, 8);
        let (tx, mut rx) = mpsc::channel(8);
        mgr.register("conn1", tx, Arc::new(Notify::new())).await;

        mgr.open("conn1", "a", vec![Filter::new()]).await;
        mgr.open("conn1", "b", vec![Filter::new()]).await;

        let event = sign_event(&keypair(), 1, vec![], "x", 100);
        assert_eq!(mgr.broadcast(&event).await, 2);
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mgr = SubscriptionManager::new(16, 8);
        let (tx, _rx) = mpsc::channel(8);
        mgr.register("conn1", tx, Arc::new(Notify::new())).await;
        mgr.open("conn1", "s", vec![Filter::new()]).await;

        assert!(mgr.close("conn1", "s").await);
        assert!(!mgr.close("conn1", "s").await);
    }

    #[tokio::test]
    async fn caps_are_enforced() {
        let mgr = SubscriptionManager::new(2, 3);
        let (tx, _rx) = mpsc::channel(8);
        mgr.register("conn1", tx, Arc::new(Notify::new())).await;

        assert!(mgr.check_caps("conn1", "s1", 4).await.is_err());

        mgr.open("conn1", "s1", vec![Filter::new()]).await;
        mgr.open("conn1", "s2", vec![Filter::new()]).await;
        let err = mgr.check_caps("conn1", "s3", 1).await.unwrap_err();
        assert!(err.starts_with("invalid: too many subscriptions"));
        // Replacing an existing subscription is fine at the cap.
        assert!(mgr.check_caps("conn1", "s2", 1).await.is_ok());
    }

    #[tokio::test]
    async fn overflow_triggers_disconnect() {
        let mgr = SubscriptionManager::new(16, 8);
        let (tx, _rx) = mpsc::channel(1);
        let disconnect = Arc::new(Notify::new());
        mgr.register("conn1", tx, disconnect.clone()).await;
        mgr.open("conn1", "a", vec![Filter::new()]).await;
        mgr.open("conn1", "b", vec![Filter::new()]).await;

        let notified = disconnect.notified();
        let event = sign_event(&keypair(), 1, vec![], "x", 100);
        // Queue depth 1: the second frame overflows.
        let delivered = mgr.broadcast(&event).await;
        assert_eq!(delivered, 1);
        notified.await;

        let reason = mgr.take_disconnect_reason("conn1").await;
        assert_eq!(reason.as_deref(), Some("rate-limited: backpressure"));
        assert_eq!(mgr.subscription_count("conn1").await, 0);
    }

    #[tokio::test]
    async fn unregistered_connection_gets_nothing() {
        let mgr = SubscriptionManager::new(16, 8);
        let (tx, mut rx) = mpsc::channel(8);
        mgr.register("conn1", tx, Arc::new(Notify::new())).await;
        mgr.open("conn1", "s", vec![Filter::new()]).await;
        mgr.unregister("conn1").await;

        let event = sign_event(&keypair(), 1, vec![], "x", 100);
        assert_eq!(mgr.broadcast(&event).await, 0);
        assert!(rx.try_recv().is_err());
    }
}
