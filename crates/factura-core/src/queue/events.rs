//! Job lifecycle tracking and events.
//!
//! The tracker is the queue's source of truth for job state. It also feeds a
//! bounded event channel for observers; events are dropped rather than ever
//! blocking a worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};

use crate::config::Settings;

/// Queue state of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

/// Bookkeeping for one job, kept after completion for audit until the
/// retention policy purges it.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: String,
    pub document_id: String,
    pub state: JobState,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Job lifecycle notification.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Enqueued {
        job_id: String,
        document_id: String,
    },
    Started {
        job_id: String,
        attempt: u32,
    },
    Retrying {
        job_id: String,
        attempt: u32,
        delay: Duration,
    },
    Completed {
        job_id: String,
        needs_human_review: bool,
    },
    Failed {
        job_id: String,
        attempts: u32,
        error: String,
    },
}

/// How long finished job records stick around.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub completed_max_age: chrono::Duration,
    pub completed_max_count: usize,
    pub failed_max_age: chrono::Duration,
}

impl RetentionPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            completed_max_age: chrono::Duration::seconds(settings.completed_retention_secs),
            completed_max_count: settings.completed_retention_count,
            failed_max_age: chrono::Duration::seconds(settings.failed_retention_secs),
        }
    }
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Shared job state map plus the observer event channel.
#[derive(Clone)]
pub struct JobTracker {
    inner: Arc<RwLock<HashMap<String, JobRecord>>>,
    events: mpsc::Sender<JobEvent>,
}

impl JobTracker {
    pub fn new() -> (Self, mpsc::Receiver<JobEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                inner: Arc::new(RwLock::new(HashMap::new())),
                events: tx,
            },
            rx,
        )
    }

    fn emit(&self, event: JobEvent) {
        // Observers are best-effort; a full channel never blocks the queue.
        let _ = self.events.try_send(event);
    }

    /// Reserve a job id for enqueue. Returns `false` when the job is already
    /// waiting or active, which is what makes enqueue idempotent.
    pub async fn try_reserve(&self, job_id: &str, document_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.get(job_id) {
            if matches!(record.state, JobState::Waiting | JobState::Active) {
                return false;
            }
        }
        inner.insert(
            job_id.to_string(),
            JobRecord {
                job_id: job_id.to_string(),
                document_id: document_id.to_string(),
                state: JobState::Waiting,
                attempts: 0,
                enqueued_at: Utc::now(),
                finished_at: None,
                error: None,
            },
        );
        drop(inner);
        self.emit(JobEvent::Enqueued {
            job_id: job_id.to_string(),
            document_id: document_id.to_string(),
        });
        true
    }

    /// Drop a reservation whose job never reached the queue. Only waiting
    /// records are released; anything a worker already picked up stays.
    pub async fn release(&self, job_id: &str) {
        let mut inner = self.inner.write().await;
        if inner
            .get(job_id)
            .is_some_and(|record| record.state == JobState::Waiting)
        {
            inner.remove(job_id);
        }
    }

    pub async fn started(&self, job_id: &str, attempt: u32) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.get_mut(job_id) {
            record.state = JobState::Active;
            record.attempts = attempt;
        }
        drop(inner);
        self.emit(JobEvent::Started {
            job_id: job_id.to_string(),
            attempt,
        });
    }

    pub async fn retrying(&self, job_id: &str, attempt: u32, delay: Duration) {
        self.emit(JobEvent::Retrying {
            job_id: job_id.to_string(),
            attempt,
            delay,
        });
    }

    pub async fn completed(&self, job_id: &str, needs_human_review: bool) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.get_mut(job_id) {
            record.state = JobState::Completed;
            record.finished_at = Some(Utc::now());
            record.error = None;
        }
        drop(inner);
        self.emit(JobEvent::Completed {
            job_id: job_id.to_string(),
            needs_human_review,
        });
    }

    pub async fn failed(&self, job_id: &str, attempts: u32, error: &str) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.get_mut(job_id) {
            record.state = JobState::Failed;
            record.attempts = attempts;
            record.finished_at = Some(Utc::now());
            record.error = Some(error.to_string());
        }
        drop(inner);
        self.emit(JobEvent::Failed {
            job_id: job_id.to_string(),
            attempts,
            error: error.to_string(),
        });
    }

    pub async fn record(&self, job_id: &str) -> Option<JobRecord> {
        self.inner.read().await.get(job_id).cloned()
    }

    /// Drop finished records past their retention. Waiting and active jobs
    /// are never purged.
    pub async fn purge(&self, now: DateTime<Utc>, policy: &RetentionPolicy) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.len();

        inner.retain(|_, record| match record.state {
            JobState::Waiting | JobState::Active => true,
            JobState::Completed => record
                .finished_at
                .map_or(true, |at| now - at <= policy.completed_max_age),
            JobState::Failed => record
                .finished_at
                .map_or(true, |at| now - at <= policy.failed_max_age),
        });

        // Count cap on completed records, oldest out first.
        let mut completed: Vec<(String, DateTime<Utc>)> = inner
            .values()
            .filter(|r| r.state == JobState::Completed)
            .map(|r| (r.job_id.clone(), r.finished_at.unwrap_or(r.enqueued_at)))
            .collect();
        if completed.len() > policy.completed_max_count {
            completed.sort_by_key(|(_, at)| *at);
            let excess = completed.len() - policy.completed_max_count;
            for (job_id, _) in completed.into_iter().take(excess) {
                inner.remove(&job_id);
            }
        }

        before - inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetentionPolicy {
        RetentionPolicy {
            completed_max_age: chrono::Duration::hours(24),
            completed_max_count: 2,
            failed_max_age: chrono::Duration::days(7),
        }
    }

    async fn finished_record(tracker: &JobTracker, job_id: &str, failed: bool) {
        assert!(tracker.try_reserve(job_id, job_id).await);
        if failed {
            tracker.failed(job_id, 3, "boom").await;
        } else {
            tracker.completed(job_id, false).await;
        }
    }

    #[tokio::test]
    async fn reserve_is_idempotent_while_pending() {
        let (tracker, _rx) = JobTracker::new();
        assert!(tracker.try_reserve("doc-1", "1").await);
        assert!(!tracker.try_reserve("doc-1", "1").await);

        tracker.started("doc-1", 1).await;
        assert!(!tracker.try_reserve("doc-1", "1").await);

        // Finished jobs may be re-enqueued.
        tracker.completed("doc-1", false).await;
        assert!(tracker.try_reserve("doc-1", "1").await);
    }

    #[tokio::test]
    async fn release_only_clears_waiting_reservations() {
        let (tracker, _rx) = JobTracker::new();
        assert!(tracker.try_reserve("doc-1", "1").await);
        tracker.release("doc-1").await;
        assert!(tracker.record("doc-1").await.is_none());
        assert!(tracker.try_reserve("doc-1", "1").await);

        assert!(tracker.try_reserve("doc-2", "2").await);
        tracker.started("doc-2", 1).await;
        tracker.release("doc-2").await;
        assert!(tracker.record("doc-2").await.is_some());
    }

    #[tokio::test]
    async fn purge_respects_age_and_state() {
        let (tracker, _rx) = JobTracker::new();
        finished_record(&tracker, "doc-done", false).await;
        finished_record(&tracker, "doc-bad", true).await;
        assert!(tracker.try_reserve("doc-live", "live").await);

        // Nothing old enough yet.
        assert_eq!(tracker.purge(Utc::now(), &policy()).await, 0);

        // Two days later the completed record ages out; failed stays.
        let later = Utc::now() + chrono::Duration::days(2);
        assert_eq!(tracker.purge(later, &policy()).await, 1);
        assert!(tracker.record("doc-done").await.is_none());
        assert!(tracker.record("doc-bad").await.is_some());
        assert!(tracker.record("doc-live").await.is_some());

        // Eight days later the failed record goes too.
        let much_later = Utc::now() + chrono::Duration::days(8);
        assert_eq!(tracker.purge(much_later, &policy()).await, 1);
        assert!(tracker.record("doc-bad").await.is_none());
    }

    #[tokio::test]
    async fn purge_caps_completed_count() {
        let (tracker, _rx) = JobTracker::new();
        for i in 0..4 {
            finished_record(&tracker, &format!("doc-{i}"), false).await;
        }

        let purged = tracker.purge(Utc::now(), &policy()).await;
        assert_eq!(purged, 2);
    }

    #[tokio::test]
    async fn events_reach_observers() {
        let (tracker, mut rx) = JobTracker::new();
        tracker.try_reserve("doc-1", "1").await;
        tracker.started("doc-1", 1).await;
        tracker.completed("doc-1", true).await;

        assert!(matches!(rx.recv().await, Some(JobEvent::Enqueued { .. })));
        assert!(matches!(rx.recv().await, Some(JobEvent::Started { attempt: 1, .. })));
        match rx.recv().await {
            Some(JobEvent::Completed {
                needs_human_review, ..
            }) => assert!(needs_human_review),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
