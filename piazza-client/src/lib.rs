pub mod api;
pub mod metrics;
pub mod retry;


pub use api::{Course, PiazzaApiClient};
pub use metrics::{ApiMetrics, MetricsCollector};
pub use retry::{RetryConfig, RetryExecutor, RetryMetrics};

use async_trait::async_trait;
use piazza_core::{CoreError, FullPost, PostSummary};

/// Source of posts for one course.
///
/// Implementations report throttling as
/// [`PiazzaApiError::RateLimited`](piazza_core::PiazzaApiError::RateLimited)
/// so callers can tell it apart from failures that should end the run.
#[async_trait]
pub trait CourseService: Send + Sync {
    /// Post summaries in feed order, at most `limit` of them.
    async fn get_feed(&self, limit: usize) -> Result<Vec<PostSummary>, CoreError>;

    async fn get_post(&self, post_id: &str) -> Result<FullPost, CoreError>;
}
