//! Email ingestion worker.
//!
//! Subscribes to the inbound-email topic and turns each message's attachments
//! into extraction jobs. Attachment failures are isolated: one bad attachment
//! never blocks its siblings, and the message is still acknowledged once every
//! attachment has been attempted. Only an unparseable envelope is nacked for
//! broker-level redelivery.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerClient, BrokerMessage, DeliveredMessage, Subscription};
use crate::models::{EmailInvoiceMessage, ExtractionJob, ModelChoice};
use crate::queue::Dispatcher;
use crate::store::DocumentStore;

/// Publish an email onto the invoice topic with the standard filtering
/// attributes.
pub async fn publish_email(
    broker: &dyn BrokerClient,
    topic: &str,
    email: &EmailInvoiceMessage,
) -> Result<()> {
    let mut attributes = BTreeMap::new();
    attributes.insert("emailId".to_string(), email.email_id.clone());
    attributes.insert("messageId".to_string(), email.message_id.clone());
    attributes.insert("from".to_string(), email.from.clone());
    attributes.insert("subject".to_string(), email.subject.clone());
    broker
        .publish(topic, BrokerMessage::encode(email, attributes)?)
        .await
}

/// Consumes inbound email messages and feeds the job queue.
///
/// `start` and `stop` are both no-ops when the worker is already in the
/// requested state.
pub struct EmailIngestWorker {
    broker: Arc<dyn BrokerClient>,
    store: Arc<dyn DocumentStore>,
    dispatcher: Arc<Dispatcher>,
    subscription: String,
    topic: String,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl EmailIngestWorker {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn DocumentStore>,
        dispatcher: Arc<Dispatcher>,
        subscription: String,
        topic: String,
    ) -> Self {
        Self {
            broker,
            store,
            dispatcher,
            subscription,
            topic,
            cancel: None,
            handle: None,
        }
    }

    /// Provision the subscription and start consuming.
    pub async fn start(&mut self) -> Result<()> {
        if self.cancel.is_some() {
            return Ok(());
        }

        let stream = self
            .broker
            .subscribe(&self.subscription, &self.topic)
            .await?;
        let cancel = CancellationToken::new();
        self.handle = Some(spawn_consumer(
            stream,
            self.store.clone(),
            self.dispatcher.clone(),
            cancel.clone(),
        ));
        self.cancel = Some(cancel);
        tracing::info!(
            subscription = %self.subscription,
            topic = %self.topic,
            "Email ingestion worker started"
        );
        Ok(())
    }

    /// Stop consuming. In-flight messages resolve as nacks and redeliver.
    pub async fn stop(&mut self) {
        let Some(cancel) = self.cancel.take() else {
            return;
        };
        cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        tracing::info!(subscription = %self.subscription, "Email ingestion worker stopped");
    }
}

fn spawn_consumer(
    mut stream: Subscription,
    store: Arc<dyn DocumentStore>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let delivered = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                delivered = stream.next() => match delivered {
                    Some(delivered) => delivered,
                    None => break,
                },
            };
            handle_delivery(store.as_ref(), &dispatcher, delivered).await;
        }
    })
}

async fn handle_delivery(
    store: &dyn DocumentStore,
    dispatcher: &Dispatcher,
    delivered: DeliveredMessage,
) {
    let email: EmailInvoiceMessage = match delivered.message.decode() {
        Ok(email) => email,
        Err(e) => {
            tracing::warn!(error = %e, "Malformed email envelope, requesting redelivery");
            delivered.nack();
            return;
        }
    };
    process_email(store, dispatcher, &email).await;
    delivered.ack();
}

/// Attempt every attachment, then mark the email processed. Never fails the
/// message: attachment errors are recorded for manual reprocessing.
async fn process_email(
    store: &dyn DocumentStore,
    dispatcher: &Dispatcher,
    email: &EmailInvoiceMessage,
) {
    let Some(user_id) = email
        .user_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
    else {
        tracing::warn!(
            email_id = %email.email_id,
            attachments = email.attachments.len(),
            "Email has no associated user, dropping attachments"
        );
        return;
    };

    let mut enqueued = 0usize;
    for attachment in &email.attachments {
        match ingest_attachment(store, dispatcher, user_id, email, attachment).await {
            Ok(job_id) => {
                enqueued += 1;
                tracing::info!(
                    email_id = %email.email_id,
                    filename = %attachment.filename,
                    job_id = %job_id,
                    "Attachment queued for extraction"
                );
            }
            Err(e) => {
                tracing::warn!(
                    email_id = %email.email_id,
                    filename = %attachment.filename,
                    error = %format!("{e:#}"),
                    "Attachment failed, continuing with siblings"
                );
                if let Err(record_err) = store
                    .record_attachment_failure(
                        &email.email_id,
                        &attachment.filename,
                        &format!("{e:#}"),
                    )
                    .await
                {
                    tracing::warn!(error = %record_err, "Could not record attachment failure");
                }
            }
        }
    }

    if let Err(e) = store.mark_email_processed(&email.email_id).await {
        tracing::warn!(email_id = %email.email_id, error = %e, "Could not mark email processed");
    }
    tracing::info!(
        email_id = %email.email_id,
        enqueued,
        attachments = email.attachments.len(),
        "Email processed"
    );
}

async fn ingest_attachment(
    store: &dyn DocumentStore,
    dispatcher: &Dispatcher,
    user_id: &str,
    email: &EmailInvoiceMessage,
    attachment: &crate::models::EmailAttachment,
) -> Result<String> {
    let document = store
        .create_from_attachment(user_id, &email.email_id, attachment)
        .await?;
    let outcome = dispatcher
        .enqueue(ExtractionJob {
            document_id: document.document_id,
            user_id: user_id.to_string(),
            file_path: document.file_path,
            file_type: document.file_type,
            file_name: document.file_name,
            selected_model: ModelChoice::Best,
        })
        .await?;
    Ok(outcome.job_id().to_string())
}
