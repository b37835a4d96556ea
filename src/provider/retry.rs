use super::ProviderError;
use crate::config::ProviderRetrySettings;
use crate::orchestration::delay::Sleeper;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ProviderRetrySettings::default())
    }
}

impl From<&ProviderRetrySettings> for RetryPolicy {
    fn from(settings: &ProviderRetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

fn jitter_fraction() -> f64 {
    let mut buf = [0u8; 4];
    match getrandom::getrandom(&mut buf) {
        Ok(()) => f64::from(u32::from_le_bytes(buf)) / f64::from(u32::MAX),
        Err(_) => 0.5,
    }
}

/// Exponential backoff for the given 1-based attempt, capped at
/// `max_delay`, plus up to 25% jitter.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = policy
        .base_delay
        .saturating_mul(1u32 << exponent)
        .min(policy.max_delay);
    base + base.mul_f64(0.25 * jitter_fraction())
}

/// Runs `call` until it succeeds, fails permanently, or the attempt budget
/// is spent. `call` receives the 1-based attempt number.
pub fn with_retries<T, F>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    operation: &str,
    mut call: F,
) -> Result<T, ProviderError>
where
    F: FnMut(u32) -> Result<T, ProviderError>,
{
    let mut attempt = 1;
    loop {
        match call(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = backoff_delay(policy, attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient provider failure, retrying"
                );
                sleeper.sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
