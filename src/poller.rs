//! Run poller
//!
//! Waits for a run to settle with multiplicative backoff. Rate-limited
//! failures get an extended sleep and keep retrying; every other terminal
//! state surfaces immediately. Backoff stepping is a pure struct so the
//! schedule is testable without real sleeps.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::assistant::ReasoningService;
use crate::error::EngineError;
use crate::models::{Run, RunError, RunStatus};
use crate::Result;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub seed: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub max_attempts: u32,
    /// Extended sleep when the run failed with a rate-limit error.
    pub throttle_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            seed: Duration::from_millis(500),
            factor: 1.4,
            cap: Duration::from_secs(4),
            max_attempts: 25,
            throttle_delay: Duration::from_secs(30),
        }
    }
}

/// Backoff state advanced by [`PollBackoff::next_delay`]. Delays are
/// non-decreasing and capped; `None` means the attempt budget is spent.
#[derive(Debug)]
pub struct PollBackoff {
    config: BackoffConfig,
    delay: Duration,
    attempt: u32,
}

impl PollBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        let delay = config.seed;
        Self {
            config,
            delay,
            attempt: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        self.attempt += 1;

        let current = self.delay;
        let grown = self.delay.as_secs_f64() * self.config.factor;
        self.delay = Duration::from_secs_f64(grown).min(self.config.cap);
        Some(current)
    }
}

fn is_rate_limited(error: &Option<RunError>) -> bool {
    let Some(error) = error else {
        return false;
    };
    if matches!(error.code.as_deref(), Some("rate_limit_exceeded")) {
        return true;
    }
    let message = error.message.to_lowercase();
    message.contains("rate limit") || message.contains("rate_limit")
}

/// Poll until the run reaches a state the dispatcher (or the final read)
/// can proceed from. `completed` and `requires_action` short-circuit on the
/// same poll that produced them.
pub async fn poll_until_settled(
    service: &dyn ReasoningService,
    thread_id: &str,
    run_id: &str,
    config: &BackoffConfig,
) -> Result<Run> {
    let mut backoff = PollBackoff::new(config.clone());

    loop {
        let run = service.get_run(thread_id, run_id).await?;

        match run.status {
            RunStatus::Completed | RunStatus::RequiresAction => {
                debug!(
                    run_id = %run.id,
                    status = ?run.status,
                    attempts = backoff.attempts(),
                    "Run settled"
                );
                return Ok(run);
            }
            RunStatus::Queued | RunStatus::InProgress => {
                let Some(delay) = backoff.next_delay() else {
                    return Err(EngineError::AssistantUnavailable(format!(
                        "Run {} still {:?} after {} polls",
                        run.id, run.status, backoff.attempts()
                    )));
                };
                sleep(delay).await;
            }
            RunStatus::Failed if is_rate_limited(&run.last_error) => {
                // Provider throttling, not a logical failure.
                if backoff.next_delay().is_none() {
                    return Err(EngineError::Throttled(
                        "Assistant is rate limited, try again shortly".to_string(),
                    ));
                }
                warn!(run_id = %run.id, "Run failed with rate limit, extended backoff");
                sleep(config.throttle_delay).await;
            }
            RunStatus::Failed | RunStatus::Expired | RunStatus::Cancelling | RunStatus::Cancelled => {
                let detail = run
                    .last_error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| format!("run ended as {:?}", run.status));
                return Err(EngineError::AssistantUnavailable(detail));
            }
        }
    }
}
