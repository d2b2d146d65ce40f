//! In-process broker honoring the client contract.
//!
//! Messages are fanned out per subscription, delivered one at a time, and
//! redelivered after a nack (or an unresolved drop). Duplicates across
//! redeliveries are allowed, which is exactly the at-least-once contract
//! consumers must tolerate.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use super::{BrokerClient, BrokerMessage, DeliveredMessage, MessageOutcome, Subscription};

/// Pause before a nacked message becomes visible again.
const REDELIVERY_DELAY: Duration = Duration::from_millis(200);

#[derive(Default)]
struct PendingQueue {
    queue: Mutex<VecDeque<BrokerMessage>>,
    notify: Notify,
}

impl PendingQueue {
    fn push_back(&self, message: BrokerMessage) {
        self.queue.lock().expect("queue lock").push_back(message);
        self.notify.notify_one();
    }

    fn push_front(&self, message: BrokerMessage) {
        self.queue.lock().expect("queue lock").push_front(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<BrokerMessage> {
        self.queue.lock().expect("queue lock").pop_front()
    }
}

struct SubEntry {
    pending: Arc<PendingQueue>,
    forwarder_cancel: Option<CancellationToken>,
}

#[derive(Default)]
struct Inner {
    /// Subscription name -> delivery state.
    subscriptions: HashMap<String, SubEntry>,
    /// Topic -> subscription names attached to it.
    topics: HashMap<String, Vec<String>>,
}

/// In-memory [`BrokerClient`] implementation.
pub struct MemoryBroker {
    inner: Mutex<Inner>,
    reachable: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            reachable: AtomicBool::new(true),
        }
    }

    /// A broker whose liveness probe always fails. Used to exercise the
    /// readiness gate.
    pub fn unreachable() -> Self {
        let broker = Self::new();
        broker.reachable.store(false, Ordering::SeqCst);
        broker
    }

    /// Flip reachability at runtime (lazy-reconnection scenarios).
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn ping(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            anyhow::bail!("broker unreachable")
        }
    }

    async fn publish(&self, topic: &str, message: BrokerMessage) -> Result<()> {
        let inner = self.inner.lock().expect("broker lock");
        let Some(names) = inner.topics.get(topic) else {
            tracing::debug!(topic, "No subscriptions on topic, message dropped");
            return Ok(());
        };
        for name in names {
            if let Some(entry) = inner.subscriptions.get(name) {
                entry.pending.push_back(message.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, subscription: &str, topic: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let pending = {
            let mut inner = self.inner.lock().expect("broker lock");

            let names = inner.topics.entry(topic.to_string()).or_default();
            if !names.iter().any(|n| n == subscription) {
                names.push(subscription.to_string());
            }

            let entry = inner
                .subscriptions
                .entry(subscription.to_string())
                .or_insert_with(|| SubEntry {
                    pending: Arc::new(PendingQueue::default()),
                    forwarder_cancel: None,
                });

            // A re-subscribe replaces the previous consumer.
            if let Some(previous) = entry.forwarder_cancel.replace(cancel.clone()) {
                previous.cancel();
            }
            entry.pending.clone()
        };

        tokio::spawn(forward(pending, tx, cancel));
        Ok(Subscription::new(rx))
    }
}

/// Per-subscription delivery loop: pop, deliver, wait for the outcome,
/// requeue on nack.
async fn forward(
    pending: Arc<PendingQueue>,
    tx: mpsc::Sender<DeliveredMessage>,
    cancel: CancellationToken,
) {
    loop {
        let message = loop {
            if let Some(message) = pending.pop() {
                break message;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = pending.notify.notified() => {}
            }
        };

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let delivered = DeliveredMessage::new(message.clone(), outcome_tx);
        if tx.send(delivered).await.is_err() {
            // Consumer gone; keep the message for the next subscriber.
            pending.push_front(message);
            return;
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                pending.push_front(message);
                return;
            }
            outcome = outcome_rx => outcome.unwrap_or(MessageOutcome::Nack),
        };

        if outcome == MessageOutcome::Nack {
            tokio::time::sleep(REDELIVERY_DELAY).await;
            pending.push_back(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn message(text: &str) -> BrokerMessage {
        BrokerMessage::encode(&serde_json::json!({ "text": text }), BTreeMap::new()).unwrap()
    }

    fn text_of(delivered: &DeliveredMessage) -> String {
        let value: serde_json::Value = delivered.message.decode().unwrap();
        value["text"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn delivers_published_messages() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("s1", "t1").await.unwrap();

        broker.publish("t1", message("hello")).await.unwrap();

        let delivered = sub.next().await.unwrap();
        assert_eq!(text_of(&delivered), "hello");
        delivered.ack();
    }

    #[tokio::test(start_paused = true)]
    async fn nack_triggers_redelivery() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("s1", "t1").await.unwrap();

        broker.publish("t1", message("again")).await.unwrap();

        let first = sub.next().await.unwrap();
        first.nack();

        let second = sub.next().await.unwrap();
        assert_eq!(text_of(&second), "again");
        second.ack();
    }

    #[tokio::test(start_paused = true)]
    async fn unresolved_drop_counts_as_nack() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("s1", "t1").await.unwrap();

        broker.publish("t1", message("dropped")).await.unwrap();

        let first = sub.next().await.unwrap();
        drop(first);

        let second = sub.next().await.unwrap();
        assert_eq!(text_of(&second), "dropped");
        second.ack();
    }

    #[tokio::test]
    async fn ack_stops_redelivery() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("s1", "t1").await.unwrap();

        broker.publish("t1", message("once")).await.unwrap();
        sub.next().await.unwrap().ack();

        broker.publish("t1", message("next")).await.unwrap();
        let delivered = sub.next().await.unwrap();
        assert_eq!(text_of(&delivered), "next");
        delivered.ack();
    }

    #[tokio::test]
    async fn ping_reflects_reachability() {
        let broker = MemoryBroker::unreachable();
        assert!(broker.ping().await.is_err());

        broker.set_reachable(true);
        assert!(broker.ping().await.is_ok());
    }
}
