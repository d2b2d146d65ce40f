//! Pipeline error taxonomy.
//!
//! Transient errors feed the job retry policy; validation anomalies are not
//! errors at all (they become [`crate::models::ValidationFlags`]).

use thiserror::Error;

/// Errors surfaced by the extraction pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Broker or provider unreachable. Retried per the backoff policy.
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    /// Malformed or missing provider response. Triggers the fallback chain,
    /// then the job retry policy.
    #[error("provider '{provider}' extraction failed: {message}")]
    ProviderExtraction { provider: String, message: String },

    /// The job itself is unusable; retrying cannot help.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    /// Broker unreachable after the readiness gate exhausted its retries
    /// under the fail-fast policy.
    #[error("broker unreachable after {attempts} attempts: {message}")]
    FatalStartup { attempts: u32, message: String },
}

impl PipelineError {
    /// Whether the job queue should retry after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientInfra(_) | PipelineError::ProviderExtraction { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(PipelineError::TransientInfra("broker down".into()).is_transient());
        assert!(PipelineError::ProviderExtraction {
            provider: "gemini".into(),
            message: "timeout".into(),
        }
        .is_transient());
        assert!(!PipelineError::InvalidJob("empty documentId".into()).is_transient());
        assert!(!PipelineError::FatalStartup {
            attempts: 5,
            message: "unreachable".into(),
        }
        .is_transient());
    }
}
