//! Resumable harvest of every post in a Piazza course.

pub mod checkpoint;

pub use checkpoint::{CheckpointStore, ResumeState};

use chrono::{DateTime, Utc};
use piazza_client::{CourseService, PiazzaApiClient, RetryConfig, RetryExecutor, RetryMetrics};
use piazza_core::{CoreError, ErrorReporter, FullPost, HarvestConfig, SimplifiedPost};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Knobs for a single harvest pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestSettings {
    pub feed_limit: usize,
    /// Rewrite the checkpoint after this many new posts. `0` writes it only
    /// once, at the end of a completed run.
    pub checkpoint_every: usize,
}

impl From<&HarvestConfig> for HarvestSettings {
    fn from(config: &HarvestConfig) -> Self {
        Self {
            feed_limit: config.feed_limit,
            checkpoint_every: config.checkpoint_every,
        }
    }
}

/// What a finished harvest did.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feed_size: usize,
    /// Posts carried over from the checkpoint.
    pub resumed: usize,
    /// Feed entries skipped because they were already saved.
    pub already_fetched: usize,
    pub fetched: usize,
    /// Posts given up on after every attempt was throttled.
    pub dropped: Vec<String>,
    /// Posts whose detail came back without any history.
    pub empty: Vec<String>,
    pub total_saved: usize,
    pub output_path: PathBuf,
}

impl HarvestReport {
    pub fn log_summary(&self) {
        let elapsed = self.finished_at - self.started_at;
        info!(
            feed = self.feed_size,
            resumed = self.resumed,
            fetched = self.fetched,
            dropped = self.dropped.len(),
            empty = self.empty.len(),
            elapsed_secs = elapsed.num_seconds(),
            "Harvest complete"
        );
        info!(
            "Saved {} posts to {}",
            self.total_saved,
            self.output_path.display()
        );
        if !self.dropped.is_empty() {
            warn!("Dropped after repeated throttling: {}", self.dropped.join(", "));
        }
    }
}

/// Walks a course feed and saves the detail of every post not already on
/// disk.
///
/// Posts are fetched one at a time in feed order. Throttled fetches back off
/// and retry; a post that stays throttled is dropped from this run and will be
/// tried again on the next one. Any other error stops the run after flushing
/// the checkpoint.
pub struct Harvester<S> {
    service: S,
    store: CheckpointStore,
    settings: HarvestSettings,
    retry: RetryExecutor,
    cancel: CancellationToken,
}

impl<S: CourseService> Harvester<S> {
    pub fn new(
        service: S,
        store: CheckpointStore,
        settings: HarvestSettings,
        retry: RetryConfig,
    ) -> Self {
        Self {
            service,
            store,
            settings,
            retry: RetryExecutor::new(retry),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.retry =
            RetryExecutor::new(self.retry.config().clone()).with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    pub fn retry_metrics(&self) -> &RetryMetrics {
        self.retry.metrics()
    }

    pub async fn run(&mut self) -> Result<HarvestReport, CoreError> {
        let started_at = Utc::now();

        let summaries = self.service.get_feed(self.settings.feed_limit).await?;
        info!("Feed lists {} posts", summaries.len());

        let mut state = match self.store.load_partial().await? {
            Some(posts) => ResumeState::from_posts(posts),
            None => ResumeState::default(),
        };
        if !state.is_empty() {
            info!("Resuming with {} posts already saved", state.len());
        }

        let resumed = state.len();
        let mut already_fetched = 0;
        let mut fetched = 0;
        let mut dropped = Vec::new();
        let mut empty = Vec::new();
        let mut unsaved = 0;

        for summary in &summaries {
            if state.contains(&summary.id) {
                already_fetched += 1;
                continue;
            }

            let full = match self.fetch(&summary.id).await {
                Ok(Some(full)) => full,
                Ok(None) => {
                    dropped.push(summary.id.clone());
                    continue;
                }
                Err(error) => {
                    if unsaved > 0 {
                        self.flush_after_failure(&state).await;
                    }
                    return Err(error);
                }
            };

            let Some(post) = SimplifiedPost::from_full(&summary.id, &full) else {
                warn!("Post {} has no history, skipping", summary.id);
                empty.push(summary.id.clone());
                continue;
            };

            state.push(post);
            fetched += 1;
            unsaved += 1;

            if self.settings.checkpoint_every > 0 && unsaved >= self.settings.checkpoint_every {
                self.store.save_partial(state.posts()).await?;
                unsaved = 0;
            }

            if fetched % 50 == 0 {
                info!("Fetched {} new posts ({} saved)", fetched, state.len());
            }
        }

        // Completed runs always leave a checkpoint covering everything saved.
        self.store.save_partial(state.posts()).await?;
        self.store.save_output(state.posts()).await?;

        Ok(HarvestReport {
            started_at,
            finished_at: Utc::now(),
            feed_size: summaries.len(),
            resumed,
            already_fetched,
            fetched,
            dropped,
            empty,
            total_saved: state.len(),
            output_path: self.store.output_path().to_path_buf(),
        })
    }

    async fn fetch(&mut self, post_id: &str) -> Result<Option<FullPost>, CoreError> {
        if self.cancel.is_cancelled() {
            info!("Harvest cancelled before {}", post_id);
            return Err(CoreError::Cancelled);
        }
        let service = &self.service;
        self.retry
            .fetch_with_retry(post_id, || service.get_post(post_id))
            .await
    }

    /// Persists progress on the way out of a failed run. A write failure here
    /// is logged so the original error still reaches the caller.
    async fn flush_after_failure(&self, state: &ResumeState) {
        if self.settings.checkpoint_every == 0 {
            return;
        }
        match self.store.save_partial(state.posts()).await {
            Ok(()) => info!("Checkpoint flushed with {} posts", state.len()),
            Err(error) => ErrorReporter::new()
                .with_warning_reporting(true)
                .report_warning(&error),
        }
    }
}

/// Logs in with the configured credentials and harvests the configured
/// course.
pub async fn run(
    config: &HarvestConfig,
    cancel: CancellationToken,
) -> Result<HarvestReport, CoreError> {
    let (email, password) = config.credentials()?;

    let mut client = PiazzaApiClient::new(
        &config.api_base_url,
        &config.user_agent,
        config.request_timeout(),
    )?;
    client.login(email, password).await?;

    let client = Arc::new(client);
    let course = client.network(&config.course_id)?;
    let store = CheckpointStore::new(&config.partial_path, &config.output_path);

    let mut harvester = Harvester::new(
        course,
        store,
        HarvestSettings::from(config),
        RetryConfig::try_from(&config.retry)?,
    )
    .with_cancellation(cancel);

    let result = harvester.run().await;

    let api = client.get_metrics().await;
    let retry = harvester.retry_metrics();
    info!(
        requests = api.total_requests,
        rate_limited = api.rate_limited_requests,
        throttle_ratio = format!("{:.2}", api.throttle_ratio()),
        transport_failures = api.transport_failures,
        retries_succeeded = retry.successful_retries,
        backoff_secs = retry.total_wait().as_secs_f64(),
        "Piazza API usage"
    );
    for (method, stats) in &api.by_method {
        debug!(
            method = %method,
            calls = stats.calls,
            failures = stats.failures,
            throttled = stats.throttled,
            avg_ms = stats.average_response_time().as_millis() as u64,
            "RPC method usage"
        );
    }

    result
}
