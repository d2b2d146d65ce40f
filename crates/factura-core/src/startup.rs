//! Startup readiness gate.
//!
//! Probes broker liveness with bounded retries before the pipeline accepts
//! work. What happens when the broker stays unreachable is a configuration
//! choice: fail the process, or degrade and rely on the client's lazy
//! reconnection. The chosen policy applies to the whole startup path.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::BrokerClient;
use crate::config::Settings;
use crate::error::PipelineError;

/// Terminal action when the broker stays unreachable after all probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessPolicy {
    /// Abort startup with a fatal error.
    FailFast,
    /// Log a warning and continue; the broker client reconnects lazily.
    #[default]
    RetryThenDegrade,
}

/// Outcome of a passed gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Broker answered a probe.
    Ready,
    /// Broker never answered; startup continues under the degrade policy.
    Degraded,
}

/// Bounded-retry liveness gate in front of the pipeline.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    attempts: u32,
    initial_backoff: Duration,
    policy: ReadinessPolicy,
}

impl ReadinessGate {
    pub fn new(attempts: u32, initial_backoff: Duration, policy: ReadinessPolicy) -> Self {
        Self {
            attempts,
            initial_backoff,
            policy,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.readiness_attempts,
            settings.readiness_backoff(),
            settings.readiness_policy,
        )
    }

    /// Probe the broker until it answers or the attempts are exhausted, then
    /// resolve the configured policy.
    pub async fn wait_until_ready(
        &self,
        broker: &dyn BrokerClient,
    ) -> Result<Readiness, PipelineError> {
        let mut backoff = self.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            match broker.ping().await {
                Ok(()) => {
                    tracing::info!(attempt, "Broker reachable");
                    return Ok(Readiness::Ready);
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        attempt,
                        attempts = self.attempts,
                        error = %e,
                        "Broker liveness probe failed"
                    );
                    if attempt < self.attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        match self.policy {
            ReadinessPolicy::FailFast => Err(PipelineError::FatalStartup {
                attempts: self.attempts,
                message: last_error,
            }),
            ReadinessPolicy::RetryThenDegrade => {
                tracing::warn!(
                    attempts = self.attempts,
                    "Broker unreachable, continuing startup with lazy reconnection"
                );
                Ok(Readiness::Degraded)
            }
        }
    }
}
