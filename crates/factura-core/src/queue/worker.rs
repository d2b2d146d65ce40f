//! Queue worker pool.
//!
//! Workers pull jobs from a shared receiver, run one extraction attempt at a
//! time under a timeout, and retry transient failures with doubling backoff.
//! A job is finished exactly once: completed on the first successful attempt,
//! failed after the last.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::extract::ExtractionRouter;
use crate::models::{job_id, DocumentStatus, ExtractionJob};
use crate::store::DocumentStore;
use crate::validate::{self, HistoricalIndex, ValidationConfig};

use super::events::JobTracker;

/// Multiple workers pull from one queue.
pub(crate) type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<ExtractionJob>>>;

/// Everything one attempt needs, shared across the pool.
pub(crate) struct JobContext {
    pub router: Arc<ExtractionRouter>,
    pub store: Arc<dyn DocumentStore>,
    pub index: HistoricalIndex,
    pub validation: ValidationConfig,
    pub tracker: JobTracker,
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub job_timeout: Duration,
}

pub(crate) fn spawn_job_workers(
    count: usize,
    rx: SharedReceiver,
    ctx: Arc<JobContext>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker| {
            let rx = rx.clone();
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tracing::debug!(worker, "Job worker started");
                loop {
                    let job = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        job = async { rx.lock().await.recv().await } => match job {
                            Some(job) => job,
                            None => break,
                        },
                    };
                    run_job(&ctx, &job).await;
                }
                tracing::debug!(worker, "Job worker stopped");
            })
        })
        .collect()
}

/// Drive one job through its attempts to a terminal state.
async fn run_job(ctx: &JobContext, job: &ExtractionJob) {
    let id = job_id(&job.document_id);
    let mut backoff = ctx.initial_backoff;

    for attempt in 1..=ctx.attempts {
        ctx.tracker.started(&id, attempt).await;
        if let Err(e) = ctx
            .store
            .set_status(&job.document_id, DocumentStatus::Processing)
            .await
        {
            tracing::warn!(job_id = %id, error = %e, "Failed to mark document processing");
        }

        let outcome = match tokio::time::timeout(ctx.job_timeout, process(ctx, &id, job)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PipelineError::TransientInfra(format!(
                "attempt timed out after {:?}",
                ctx.job_timeout
            ))),
        };

        match outcome {
            Ok(needs_human_review) => {
                tracing::info!(job_id = %id, attempt, needs_human_review, "Job completed");
                ctx.tracker.completed(&id, needs_human_review).await;
                return;
            }
            Err(e) if e.is_transient() && attempt < ctx.attempts => {
                tracing::warn!(
                    job_id = %id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                ctx.tracker.retrying(&id, attempt, backoff).await;
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => {
                let error = e.to_string();
                tracing::error!(job_id = %id, attempt, error = %error, "Job failed");
                if let Err(store_err) = ctx.store.fail_extraction(&job.document_id, &error).await {
                    tracing::warn!(job_id = %id, error = %store_err, "Failed to record job failure");
                }
                ctx.tracker.failed(&id, attempt, &error).await;
                return;
            }
        }
    }
}

/// One attempt: extract, validate against the index snapshot, write the
/// result back atomically, then record it in the index.
async fn process(
    ctx: &JobContext,
    id: &str,
    job: &ExtractionJob,
) -> Result<bool, PipelineError> {
    let result = ctx.router.extract(job).await?;

    let snapshot = ctx.index.snapshot().await;
    let flags = validate::validate(&result, &snapshot, &ctx.validation);
    let needs_human_review = flags.needs_human_review;

    ctx.store
        .complete_extraction(&job.document_id, result.clone(), flags.clone())
        .await
        .map_err(|e| PipelineError::TransientInfra(format!("result write failed: {e:#}")))?;

    // Index only documents whose write stuck: a retried attempt must not
    // find its own earlier fingerprint and flag itself a duplicate.
    ctx.index.insert(id, &result, &flags).await;
    Ok(needs_human_review)
}
