//! Factura core - asynchronous invoice extraction pipeline
//!
//! This crate contains the whole document pipeline:
//! - Job queue with idempotent enqueue and retry/backoff (`queue`)
//! - Multi-provider AI extraction with fallback chains (`extract`)
//! - Validation and deduplication of extracted invoices (`validate`)
//! - Email ingestion over the message broker (`email`, `broker`)
//! - Startup readiness gate against the broker (`startup`)

pub mod broker;
pub mod config;
pub mod email;
pub mod error;
pub mod extract;
pub mod models;
pub mod queue;
pub mod startup;
pub mod store;
pub mod validate;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

pub use config::{Config, Settings};
pub use error::PipelineError;
pub use models::{CanonicalExtractionResult, ExtractionJob, ValidationFlags};
pub use queue::{Dispatcher, JobEvent};
pub use startup::Readiness;

use broker::BrokerClient;
use email::EmailIngestWorker;
use extract::ExtractionRouter;
use startup::ReadinessGate;
use store::DocumentStore;
use validate::HistoricalIndex;

/// The running pipeline: readiness gate passed, worker pool live, email
/// ingestion attached to its subscription.
pub struct App {
    pub settings: Settings,
    pub readiness: Readiness,
    dispatcher: Arc<Dispatcher>,
    email_worker: EmailIngestWorker,
}

impl App {
    /// Gate on the broker, then bring up the queue and the email worker.
    pub async fn start(
        settings: Settings,
        broker: Arc<dyn BrokerClient>,
        store: Arc<dyn DocumentStore>,
    ) -> Result<(Self, mpsc::Receiver<JobEvent>)> {
        let readiness = ReadinessGate::from_settings(&settings)
            .wait_until_ready(broker.as_ref())
            .await?;

        let router = Arc::new(ExtractionRouter::from_settings(&settings));
        let index = HistoricalIndex::new(settings.dedupe_window);
        let (dispatcher, events) =
            Dispatcher::start(&settings, router, store.clone(), index);
        let dispatcher = Arc::new(dispatcher);

        let mut email_worker = EmailIngestWorker::new(
            broker,
            store,
            dispatcher.clone(),
            settings.email_subscription.clone(),
            settings.email_topic.clone(),
        );
        email_worker.start().await?;

        tracing::info!(
            workers = settings.worker_concurrency,
            readiness = ?readiness,
            "Pipeline started"
        );
        Ok((
            Self {
                settings,
                readiness,
                dispatcher,
                email_worker,
            },
            events,
        ))
    }

    /// Handle for direct job submission (uploads that bypass email).
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Detach from the subscription and drain the worker pool.
    pub async fn shutdown(mut self) {
        self.email_worker.stop().await;
        self.dispatcher.shutdown().await;
        tracing::info!("Pipeline stopped");
    }
}
