//! Message broker client contract.
//!
//! The broker itself is an external dependency; this module defines the
//! client contract the pipeline uses (liveness probe, publish, subscribe with
//! at-least-once delivery) and an in-process implementation used as the
//! default transport and as a test double. Only this module constructs or
//! tears down the process-wide client handle.

mod memory;

pub use memory::MemoryBroker;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

/// Message envelope: base64-encoded JSON payload plus string attributes that
/// allow filtering without full deserialization.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub data: String,
    pub attributes: BTreeMap<String, String>,
}

impl BrokerMessage {
    /// Encode a payload into an envelope.
    pub fn encode<T: Serialize>(
        payload: &T,
        attributes: BTreeMap<String, String>,
    ) -> Result<Self> {
        let json = serde_json::to_vec(payload)?;
        Ok(Self {
            data: BASE64.encode(json),
            attributes,
        })
    }

    /// Decode the payload back out of the envelope.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = BASE64.decode(&self.data)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Consumer resolution for a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Ack,
    Nack,
}

/// A message handed to a subscriber. Must be resolved with [`ack`] or
/// [`nack`]; dropping it unresolved counts as a nack, which preserves
/// at-least-once semantics when a handler panics.
///
/// [`ack`]: DeliveredMessage::ack
/// [`nack`]: DeliveredMessage::nack
#[derive(Debug)]
pub struct DeliveredMessage {
    pub message: BrokerMessage,
    outcome: Option<oneshot::Sender<MessageOutcome>>,
}

impl DeliveredMessage {
    pub(crate) fn new(message: BrokerMessage, outcome: oneshot::Sender<MessageOutcome>) -> Self {
        Self {
            message,
            outcome: Some(outcome),
        }
    }

    /// Acknowledge: the broker will not redeliver this message.
    pub fn ack(mut self) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(MessageOutcome::Ack);
        }
    }

    /// Negative-acknowledge: the broker redelivers the message later.
    pub fn nack(mut self) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(MessageOutcome::Nack);
        }
    }
}

impl Drop for DeliveredMessage {
    fn drop(&mut self) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(MessageOutcome::Nack);
        }
    }
}

/// Stream of messages for one subscription.
pub struct Subscription {
    rx: mpsc::Receiver<DeliveredMessage>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<DeliveredMessage>) -> Self {
        Self { rx }
    }

    /// Next delivered message, or `None` once the broker side closes.
    pub async fn next(&mut self) -> Option<DeliveredMessage> {
        self.rx.recv().await
    }
}

/// Client contract to the shared message broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Liveness probe used by the startup readiness gate.
    async fn ping(&self) -> Result<()>;

    /// Publish a message to a topic.
    async fn publish(&self, topic: &str, message: BrokerMessage) -> Result<()>;

    /// Attach to a named subscription on a topic, creating it if absent.
    async fn subscribe(&self, subscription: &str, topic: &str) -> Result<Subscription>;
}

/// Construct the process-wide in-process broker handle.
pub fn in_memory() -> Arc<dyn BrokerClient> {
    Arc::new(MemoryBroker::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let mut attributes = BTreeMap::new();
        attributes.insert("emailId".to_string(), "e-1".to_string());

        let payload = serde_json::json!({"emailId": "e-1", "subject": "Invoice"});
        let message = BrokerMessage::encode(&payload, attributes).unwrap();

        assert_eq!(message.attributes["emailId"], "e-1");
        let decoded: serde_json::Value = message.decode().unwrap();
        assert_eq!(decoded["subject"], "Invoice");
    }

    #[test]
    fn decode_rejects_garbage() {
        let message = BrokerMessage {
            data: "not base64!!".to_string(),
            attributes: BTreeMap::new(),
        };
        assert!(message.decode::<serde_json::Value>().is_err());
    }
}
