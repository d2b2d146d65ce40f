//! Asynchronous job queue.
//!
//! The dispatcher accepts extraction jobs with idempotent, deterministic ids,
//! feeds a worker pool, and keeps finished-job records until retention purges
//! them. Lifecycle events stream to observers through the tracker.

mod events;
mod worker;

pub use events::{JobEvent, JobRecord, JobState, JobTracker, RetentionPolicy};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::PipelineError;
use crate::extract::ExtractionRouter;
use crate::models::{job_id, DocumentStatus, ExtractionJob};
use crate::store::DocumentStore;
use crate::validate::{HistoricalIndex, ValidationConfig};

use worker::{spawn_job_workers, JobContext};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Result of an enqueue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Job accepted and queued.
    Enqueued { job_id: String },
    /// Same document already waiting or active; no new job was created.
    AlreadyQueued { job_id: String },
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> &str {
        match self {
            EnqueueOutcome::Enqueued { job_id } | EnqueueOutcome::AlreadyQueued { job_id } => {
                job_id
            }
        }
    }
}

/// Job queue front end plus its worker pool.
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<ExtractionJob>,
    tracker: JobTracker,
    store: Arc<dyn DocumentStore>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawn the worker pool and the retention purge loop. Returns the
    /// dispatcher and the job event stream.
    pub fn start(
        settings: &Settings,
        router: Arc<ExtractionRouter>,
        store: Arc<dyn DocumentStore>,
        index: HistoricalIndex,
    ) -> (Self, mpsc::Receiver<JobEvent>) {
        let (tracker, event_rx) = JobTracker::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        let cancel = CancellationToken::new();

        let ctx = Arc::new(JobContext {
            router,
            store: store.clone(),
            index,
            validation: ValidationConfig::from_settings(settings),
            tracker: tracker.clone(),
            attempts: settings.job_attempts,
            initial_backoff: settings.job_backoff(),
            job_timeout: settings.job_timeout(),
        });

        let mut workers =
            spawn_job_workers(settings.worker_concurrency, rx, ctx, cancel.clone());
        workers.push(spawn_purge_loop(
            tracker.clone(),
            RetentionPolicy::from_settings(settings),
            cancel.clone(),
        ));

        (
            Self {
                tx,
                tracker,
                store,
                cancel,
                workers: Mutex::new(workers),
            },
            event_rx,
        )
    }

    /// Enqueue one document for extraction. Re-submitting a document that is
    /// already waiting or active is a no-op returning the same job id.
    pub async fn enqueue(&self, job: ExtractionJob) -> Result<EnqueueOutcome, PipelineError> {
        if job.document_id.trim().is_empty() {
            return Err(PipelineError::InvalidJob("empty documentId".to_string()));
        }
        if job.user_id.trim().is_empty() {
            return Err(PipelineError::InvalidJob("empty userId".to_string()));
        }
        // Catch dead paths here instead of burning the provider chain and
        // the full retry budget on a file that was never there.
        if !matches!(tokio::fs::try_exists(&job.file_path).await, Ok(true)) {
            return Err(PipelineError::InvalidJob(format!(
                "file path {} is not resolvable",
                job.file_path.display()
            )));
        }

        let id = job_id(&job.document_id);
        if !self.tracker.try_reserve(&id, &job.document_id).await {
            tracing::debug!(job_id = %id, "Document already queued, skipping");
            return Ok(EnqueueOutcome::AlreadyQueued { job_id: id });
        }

        if let Err(e) = self
            .store
            .set_status(&job.document_id, DocumentStatus::Queued)
            .await
        {
            self.tracker.release(&id).await;
            return Err(PipelineError::TransientInfra(format!(
                "status write failed: {e:#}"
            )));
        }

        if self.tx.send(job).is_err() {
            self.tracker.release(&id).await;
            return Err(PipelineError::TransientInfra(
                "job queue is shut down".to_string(),
            ));
        }
        tracing::info!(job_id = %id, "Job enqueued");
        Ok(EnqueueOutcome::Enqueued { job_id: id })
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    /// Stop accepting work and wait for in-flight attempts to wind down.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
    }
}

fn spawn_purge_loop(
    tracker: JobTracker,
    policy: RetentionPolicy,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(PURGE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let purged = tracker.purge(Utc::now(), &policy).await;
                    if purged > 0 {
                        tracing::debug!(purged, "Purged finished job records");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{ExtractionProvider, RawExtraction};
    use crate::models::{
        CanonicalExtractionResult, EmailAttachment, FileType, ModelChoice, ValidationFlags,
    };
    use crate::store::{MemoryStore, StoredDocument};
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Provider that replays a script of per-call outcomes, then succeeds.
    struct ScriptedProvider {
        failures: Mutex<VecDeque<bool>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(failures: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(failures.iter().copied().collect()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl ExtractionProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "gemini"
        }

        fn supports(&self, _file_type: FileType) -> bool {
            true
        }

        async fn extract(&self, _job: &ExtractionJob) -> anyhow::Result<RawExtraction> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Keep the job active long enough for the test body to observe
            // the waiting/active window under paused time.
            tokio::time::sleep(Duration::from_millis(10)).await;
            let fail = self.failures.lock().await.pop_front().unwrap_or(false);
            if fail {
                anyhow::bail!("scripted provider failure");
            }
            Ok(RawExtraction {
                invoice_id: Some("INV-100".to_string()),
                vendor_name: Some("Acme".to_string()),
                invoice_date: Some("2026-08-01".to_string()),
                total_amount: Some(108.0),
                ..Default::default()
            })
        }
    }

    /// Store that rejects the next write of a given kind, then recovers.
    struct FlakyStore {
        inner: MemoryStore,
        failing_completes: AtomicUsize,
        failing_statuses: AtomicUsize,
    }

    impl FlakyStore {
        fn new(spool_dir: PathBuf) -> Self {
            Self {
                inner: MemoryStore::new(spool_dir),
                failing_completes: AtomicUsize::new(0),
                failing_statuses: AtomicUsize::new(0),
            }
        }

        fn fail_next_complete(&self) {
            self.failing_completes.store(1, Ordering::SeqCst);
        }

        fn fail_next_status(&self) {
            self.failing_statuses.store(1, Ordering::SeqCst);
        }

        fn take(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait::async_trait]
    impl DocumentStore for FlakyStore {
        async fn create_from_attachment(
            &self,
            user_id: &str,
            email_id: &str,
            attachment: &EmailAttachment,
        ) -> anyhow::Result<StoredDocument> {
            self.inner
                .create_from_attachment(user_id, email_id, attachment)
                .await
        }

        async fn set_status(
            &self,
            document_id: &str,
            status: DocumentStatus,
        ) -> anyhow::Result<()> {
            if Self::take(&self.failing_statuses) {
                anyhow::bail!("status write rejected");
            }
            self.inner.set_status(document_id, status).await
        }

        async fn complete_extraction(
            &self,
            document_id: &str,
            result: CanonicalExtractionResult,
            flags: ValidationFlags,
        ) -> anyhow::Result<()> {
            if Self::take(&self.failing_completes) {
                anyhow::bail!("result write rejected");
            }
            self.inner
                .complete_extraction(document_id, result, flags)
                .await
        }

        async fn fail_extraction(&self, document_id: &str, error: &str) -> anyhow::Result<()> {
            self.inner.fail_extraction(document_id, error).await
        }

        async fn record_attachment_failure(
            &self,
            email_id: &str,
            filename: &str,
            error: &str,
        ) -> anyhow::Result<()> {
            self.inner
                .record_attachment_failure(email_id, filename, error)
                .await
        }

        async fn mark_email_processed(&self, email_id: &str) -> anyhow::Result<()> {
            self.inner.mark_email_processed(email_id).await
        }
    }

    fn test_job(document_id: &str, dir: &Path) -> ExtractionJob {
        let file_path = dir.join("doc.pdf");
        std::fs::write(&file_path, b"%PDF").unwrap();
        ExtractionJob {
            document_id: document_id.to_string(),
            user_id: "u-1".to_string(),
            file_path,
            file_type: FileType::Pdf,
            file_name: "doc.pdf".to_string(),
            selected_model: ModelChoice::Gemini,
        }
    }

    fn start_dispatcher(
        provider: Arc<dyn ExtractionProvider>,
        store: Arc<dyn DocumentStore>,
    ) -> Dispatcher {
        let settings = Settings {
            worker_concurrency: 2,
            ..Default::default()
        };
        let router = Arc::new(ExtractionRouter::new(
            vec![provider],
            settings.provider_timeout(),
        ));
        let (dispatcher, _events) = Dispatcher::start(
            &settings,
            router,
            store,
            HistoricalIndex::new(settings.dedupe_window),
        );
        dispatcher
    }

    fn harness(
        provider: Arc<ScriptedProvider>,
    ) -> (Dispatcher, Arc<MemoryStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new(dir.path().to_path_buf()));
        (start_dispatcher(provider, store.clone()), store, dir)
    }

    async fn wait_for_terminal(tracker: &JobTracker, job_id: &str) -> JobRecord {
        loop {
            if let Some(record) = tracker.record(job_id).await {
                if matches!(record.state, JobState::Completed | JobState::Failed) {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_is_idempotent_per_document() {
        let provider = ScriptedProvider::new(&[]);
        let (dispatcher, store, dir) = harness(provider.clone());

        let first = dispatcher.enqueue(test_job("d-1", dir.path())).await.unwrap();
        let second = dispatcher.enqueue(test_job("d-1", dir.path())).await.unwrap();

        assert_eq!(first, EnqueueOutcome::Enqueued { job_id: "doc-d-1".to_string() });
        assert_eq!(
            second,
            EnqueueOutcome::AlreadyQueued { job_id: "doc-d-1".to_string() }
        );

        let record = wait_for_terminal(dispatcher.tracker(), "doc-d-1").await;
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            store.status_of("d-1").await,
            Some(DocumentStatus::Processed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_with_backoff() {
        let provider = ScriptedProvider::new(&[true, true]);
        let (dispatcher, store, dir) = harness(provider.clone());

        let start = Instant::now();
        dispatcher.enqueue(test_job("d-2", dir.path())).await.unwrap();
        let record = wait_for_terminal(dispatcher.tracker(), "doc-d-2").await;

        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.attempts, 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        // 2s after the first failure, 4s after the second.
        assert!(start.elapsed() >= Duration::from_secs(6));
        assert_eq!(
            store.status_of("d-2").await,
            Some(DocumentStatus::Processed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_attempts_fail_terminally() {
        let provider = ScriptedProvider::new(&[true, true, true]);
        let (dispatcher, store, dir) = harness(provider.clone());

        dispatcher.enqueue(test_job("d-3", dir.path())).await.unwrap();
        let record = wait_for_terminal(dispatcher.tracker(), "doc-d-3").await;

        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempts, 3);
        assert!(record.error.is_some());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);

        let doc = store.document("d-3").await.unwrap();
        assert_eq!(doc.status, Some(DocumentStatus::Failed));
        assert!(doc.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_document_can_be_requeued() {
        let provider = ScriptedProvider::new(&[]);
        let (dispatcher, _store, dir) = harness(provider.clone());

        dispatcher.enqueue(test_job("d-4", dir.path())).await.unwrap();
        wait_for_terminal(dispatcher.tracker(), "doc-d-4").await;

        let again = dispatcher.enqueue(test_job("d-4", dir.path())).await.unwrap();
        assert_eq!(
            again,
            EnqueueOutcome::Enqueued { job_id: "doc-d-4".to_string() }
        );
        wait_for_terminal(dispatcher.tracker(), "doc-d-4").await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn blank_identifiers_are_rejected() {
        let provider = ScriptedProvider::new(&[]);
        let (dispatcher, _store, dir) = harness(provider);

        let mut job = test_job("  ", dir.path());
        let err = dispatcher.enqueue(job.clone()).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidJob(_)));

        job.document_id = "d-5".to_string();
        job.user_id = String::new();
        let err = dispatcher.enqueue(job).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidJob(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_pool() {
        let provider = ScriptedProvider::new(&[]);
        let (dispatcher, _store, dir) = harness(provider);

        dispatcher.enqueue(test_job("d-6", dir.path())).await.unwrap();
        let tracker = dispatcher.tracker().clone();
        wait_for_terminal(&tracker, "doc-d-6").await;

        dispatcher.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_store_failure_is_not_its_own_duplicate() {
        let provider = ScriptedProvider::new(&[]);
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(dir.path().to_path_buf()));
        store.fail_next_complete();
        let dispatcher = start_dispatcher(provider.clone(), store.clone());

        dispatcher.enqueue(test_job("d-7", dir.path())).await.unwrap();
        let record = wait_for_terminal(dispatcher.tracker(), "doc-d-7").await;

        // The rejected write costs one retry but must not poison the index:
        // the second attempt sees its own invoice as new, not as a duplicate.
        assert_eq!(record.state, JobState::Completed);
        assert_eq!(record.attempts, 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        let flags = store.inner.document("d-7").await.unwrap().flags.unwrap();
        assert!(!flags.is_duplicate);
        assert!(!flags.needs_human_review);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_enqueue_releases_the_reservation() {
        let provider = ScriptedProvider::new(&[]);
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FlakyStore::new(dir.path().to_path_buf()));
        store.fail_next_status();
        let dispatcher = start_dispatcher(provider.clone(), store.clone());

        let err = dispatcher.enqueue(test_job("d-8", dir.path())).await.unwrap_err();
        assert!(matches!(err, PipelineError::TransientInfra(_)));

        // The failed call must not leave a waiting record that blocks retries.
        let again = dispatcher.enqueue(test_job("d-8", dir.path())).await.unwrap();
        assert_eq!(
            again,
            EnqueueOutcome::Enqueued { job_id: "doc-d-8".to_string() }
        );
        let record = wait_for_terminal(dispatcher.tracker(), "doc-d-8").await;
        assert_eq!(record.state, JobState::Completed);
    }

    #[tokio::test]
    async fn unresolvable_path_is_rejected() {
        let provider = ScriptedProvider::new(&[]);
        let (dispatcher, _store, dir) = harness(provider.clone());

        let mut job = test_job("d-9", dir.path());
        job.file_path = dir.path().join("missing.pdf");

        let err = dispatcher.enqueue(job).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidJob(_)));
        assert!(dispatcher.tracker().record("doc-d-9").await.is_none());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }
}
