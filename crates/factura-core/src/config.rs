//! Application configuration and tunable settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::startup::ReadinessPolicy;

/// Application configuration (paths).
#[derive(Debug, Clone)]
pub struct Config {
    /// Root data directory (~/.local/share/factura)
    pub data_dir: PathBuf,
    /// Spool directory for materialized email attachments
    pub spool_dir: PathBuf,
    /// Settings file path
    pub settings_file: PathBuf,
}

impl Config {
    /// Load configuration or use defaults
    pub fn load_or_default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("factura");

        Self {
            spool_dir: data_dir.join("spool"),
            settings_file: data_dir.join("settings.json"),
            data_dir,
        }
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.spool_dir)?;
        Ok(())
    }
}

/// Persisted tunables. Every field has a default so a missing or partial
/// settings file still yields a working pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Parallel job workers.
    pub worker_concurrency: usize,
    /// Total attempts per job, including the first.
    pub job_attempts: u32,
    /// Initial retry backoff in milliseconds; doubles each attempt.
    pub job_backoff_ms: u64,
    /// Per-attempt extraction timeout in seconds.
    pub job_timeout_secs: u64,
    /// Per-provider call timeout in seconds.
    pub provider_timeout_secs: u64,

    /// Completed-job audit records: maximum age in seconds.
    pub completed_retention_secs: i64,
    /// Completed-job audit records: maximum count.
    pub completed_retention_count: usize,
    /// Failed-job records: maximum age in seconds.
    pub failed_retention_secs: i64,

    /// Startup behavior when the broker stays unreachable.
    pub readiness_policy: ReadinessPolicy,
    /// Broker liveness probes before resolving the policy.
    pub readiness_attempts: u32,
    /// Initial probe backoff in milliseconds; doubles each attempt.
    pub readiness_backoff_ms: u64,

    /// Field confidence below this requests human review.
    pub confidence_threshold: f64,
    /// Near-duplicate similarity threshold.
    pub similarity_threshold: f64,
    /// Recent-document window scanned for near-duplicates.
    pub dedupe_window: usize,

    /// Pub/sub subscription consumed by the email worker.
    pub email_subscription: String,
    /// Topic the subscription is attached to.
    pub email_topic: String,

    pub gemini_model: String,
    pub openai_model: String,
    pub groq_model: String,
    pub claude_model: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            job_attempts: 3,
            job_backoff_ms: 2000,
            job_timeout_secs: 120,
            provider_timeout_secs: 60,
            completed_retention_secs: 86_400,
            completed_retention_count: 1000,
            failed_retention_secs: 604_800,
            readiness_policy: ReadinessPolicy::RetryThenDegrade,
            readiness_attempts: 5,
            readiness_backoff_ms: 500,
            confidence_threshold: 0.85,
            similarity_threshold: 0.85,
            dedupe_window: 200,
            email_subscription: "invoice-emails".to_string(),
            email_topic: "email-invoices".to_string(),
            gemini_model: "gemini-2.0-flash".to_string(),
            openai_model: "gpt-4o-mini".to_string(),
            groq_model: "llama-3.2-90b-vision-preview".to_string(),
            claude_model: "claude-3-5-sonnet-latest".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Invalid settings file, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Persist settings as pretty JSON.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn job_backoff(&self) -> Duration {
        Duration::from_millis(self.job_backoff_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn readiness_backoff(&self) -> Duration {
        Duration::from_millis(self.readiness_backoff_ms)
    }
}

/// API key lookup for a provider, from the environment. Gemini accepts both
/// the Google-style and provider-style variable names.
pub fn provider_api_key(provider: &str) -> Option<String> {
    let vars: &[&str] = match provider {
        "gemini" => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        "openai" => &["OPENAI_API_KEY"],
        "groq" => &["GROQ_API_KEY"],
        "claude" => &["ANTHROPIC_API_KEY"],
        _ => return None,
    };
    vars.iter()
        .filter_map(|v| std::env::var(v).ok())
        .find(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_queue_policy() {
        let settings = Settings::default();
        assert_eq!(settings.job_attempts, 3);
        assert_eq!(settings.job_backoff_ms, 2000);
        assert_eq!(settings.completed_retention_secs, 86_400);
        assert_eq!(settings.completed_retention_count, 1000);
        assert_eq!(settings.failed_retention_secs, 604_800);
        assert_eq!(settings.readiness_attempts, 5);
        assert_eq!(settings.readiness_backoff_ms, 500);
    }

    #[test]
    fn partial_settings_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"worker_concurrency": 8}"#).unwrap();

        let settings = Settings::load(&path);
        assert_eq!(settings.worker_concurrency, 8);
        assert_eq!(settings.job_attempts, 3);
    }

    #[test]
    fn settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = Settings::default();
        settings.similarity_threshold = 0.9;
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path);
        assert_eq!(loaded.similarity_threshold, 0.9);
    }
}
