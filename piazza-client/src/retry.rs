use piazza_core::{ConfigError, CoreError, ErrorExt, RetrySettings};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per request, the first one included
    pub max_attempts: u32,
    /// Base wait after the first throttled attempt
    pub initial_backoff: Duration,
    /// Multiplier applied to the base wait after each throttled attempt
    pub backoff_multiplier: f64,
    /// Jitter is drawn uniformly from `[0, max_jitter)`
    pub max_jitter: Duration,
    /// Cap on the base wait
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            initial_backoff: Duration::from_secs(3),
            backoff_multiplier: 2.0,
            max_jitter: Duration::from_millis(1500),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl TryFrom<&RetrySettings> for RetryConfig {
    type Error = ConfigError;

    fn try_from(settings: &RetrySettings) -> Result<Self, Self::Error> {
        Ok(Self {
            max_attempts: settings.max_attempts,
            initial_backoff: seconds("retry.initial_backoff_secs", settings.initial_backoff_secs)?,
            backoff_multiplier: settings.backoff_multiplier,
            max_jitter: seconds("retry.max_jitter_secs", settings.max_jitter_secs)?,
            max_backoff: seconds("retry.max_backoff_secs", settings.max_backoff_secs)?,
        })
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Retry strategy based on error type
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// Back off and try again
    Retry,
    /// Propagate immediately
    NoRetry,
}

/// Only throttling is recovered locally.
pub fn get_retry_strategy(error: &CoreError) -> RetryStrategy {
    if error.is_retryable() {
        RetryStrategy::Retry
    } else {
        RetryStrategy::NoRetry
    }
}

/// Base wait before jitter for the given zero-based attempt.
pub fn base_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let multiplier = config.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
    let secs = (config.initial_backoff.as_secs_f64() * multiplier)
        .min(config.max_backoff.as_secs_f64());
    // Anything the float math cannot represent is past the cap anyway
    Duration::try_from_secs_f64(secs)
        .unwrap_or(config.max_backoff)
        .min(config.max_backoff)
}

pub fn jitter(config: &RetryConfig) -> Duration {
    config.max_jitter.mul_f64(fastrand::f64())
}

/// Calculate delay with exponential backoff and jitter
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    base_delay(attempt, config).saturating_add(jitter(config))
}

/// One backoff pause taken after a throttled attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffWait {
    pub post_id: String,
    pub base: Duration,
    pub jitter: Duration,
}

/// Retry metrics for monitoring
#[derive(Debug, Clone, Default)]
pub struct RetryMetrics {
    /// Every call to the wrapped operation
    pub total_attempts: u64,
    pub rate_limited_attempts: u64,
    /// Requests that succeeded after at least one throttled attempt
    pub successful_retries: u64,
    /// Requests given up on after exhausting every attempt
    pub exhausted: u64,
    pub waits: Vec<BackoffWait>,
}

impl RetryMetrics {
    pub fn total_wait(&self) -> Duration {
        self.waits
            .iter()
            .fold(Duration::ZERO, |total, w| {
                total.saturating_add(w.base).saturating_add(w.jitter)
            })
    }
}

/// Wraps fetches with the throttling backoff policy.
///
/// Throttled attempts are retried after an exponentially growing, jittered,
/// cancellable wait. Any other error propagates on the spot. When every
/// attempt is throttled the fetch resolves to `Ok(None)` so the caller can
/// skip the item.
#[derive(Debug)]
pub struct RetryExecutor {
    config: RetryConfig,
    cancel: CancellationToken,
    metrics: RetryMetrics,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            metrics: RetryMetrics::default(),
        }
    }

    /// Waits abort with [`CoreError::Cancelled`] once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn fetch_with_retry<F, Fut, T>(
        &mut self,
        post_id: &str,
        mut fetch_one: F,
    ) -> Result<Option<T>, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        for attempt in 0..self.config.max_attempts {
            if attempt > 0 {
                debug!("Retry attempt {} for {}", attempt, post_id);
            }

            self.metrics.total_attempts += 1;
            match fetch_one().await {
                Ok(value) => {
                    if attempt > 0 {
                        self.metrics.successful_retries += 1;
                        info!("Fetched {} after {} retries", post_id, attempt);
                    }
                    return Ok(Some(value));
                }
                Err(error) => match get_retry_strategy(&error) {
                    RetryStrategy::NoRetry => {
                        debug!("Not retrying {} due to error type: {}", post_id, error);
                        return Err(error);
                    }
                    RetryStrategy::Retry => {
                        self.metrics.rate_limited_attempts += 1;
                        let base = base_delay(attempt, &self.config);
                        let jitter = jitter(&self.config);
                        warn!(
                            "Rate limit hit on {}. Backing off {:.1}s...",
                            post_id,
                            base.as_secs_f64()
                        );
                        self.metrics.waits.push(BackoffWait {
                            post_id: post_id.to_string(),
                            base,
                            jitter,
                        });
                        self.wait(base.saturating_add(jitter)).await?;
                    }
                },
            }
        }

        self.metrics.exhausted += 1;
        warn!(
            "Skipping {} after {} failed attempts.",
            post_id, self.config.max_attempts
        );
        Ok(None)
    }

    async fn wait(&self, delay: Duration) -> Result<(), CoreError> {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                info!("Backoff interrupted by cancellation");
                Err(CoreError::Cancelled)
            }
            _ = sleep(delay) => Ok(()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn metrics(&self) -> &RetryMetrics {
        &self.metrics
    }

    pub fn reset_metrics(&mut self) {
        self.metrics = RetryMetrics::default();
    }
}
