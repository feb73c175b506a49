use async_trait::async_trait;
use harvest_service::{CheckpointStore, HarvestSettings, Harvester};
use piazza_client::{CourseService, RetryConfig};
use piazza_core::{
    Answers, CoreError, FullPost, HistoryEntry, PiazzaApiError, PostSummary, SimplifiedPost,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
enum Reply {
    Post(FullPost),
    /// Throttled this many times, then the post.
    ThrottledThen(u32, FullPost),
    AlwaysThrottled,
    Fails,
}

/// Scripted course that records every detail request. Clones share the log.
#[derive(Clone)]
struct FakeCourse {
    feed: Vec<PostSummary>,
    replies: HashMap<String, Reply>,
    calls: Arc<Mutex<Vec<String>>>,
    cancel_after_first: Option<CancellationToken>,
}

impl FakeCourse {
    fn new(feed: &[&str]) -> Self {
        Self {
            feed: feed
                .iter()
                .map(|id| PostSummary { id: id.to_string() })
                .collect(),
            replies: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
            cancel_after_first: None,
        }
    }

    fn reply(mut self, id: &str, reply: Reply) -> Self {
        self.replies.insert(id.to_string(), reply);
        self
    }

    fn calls_for(&self, id: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == id).count()
    }

    fn requested(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CourseService for FakeCourse {
    async fn get_feed(&self, limit: usize) -> Result<Vec<PostSummary>, CoreError> {
        Ok(self.feed.iter().take(limit).cloned().collect())
    }

    async fn get_post(&self, post_id: &str) -> Result<FullPost, CoreError> {
        let seen = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(post_id.to_string());
            calls.iter().filter(|c| *c == post_id).count() as u32
        };
        if let Some(cancel) = &self.cancel_after_first {
            cancel.cancel();
        }

        match self.replies.get(post_id).cloned() {
            Some(Reply::Post(post)) => Ok(post),
            Some(Reply::ThrottledThen(n, post)) if seen > n => Ok(post),
            Some(Reply::ThrottledThen(..)) | Some(Reply::AlwaysThrottled) => {
                Err(CoreError::Piazza(PiazzaApiError::RateLimited {
                    message: "You are making requests too fast".to_string(),
                }))
            }
            Some(Reply::Fails) => Err(CoreError::Piazza(PiazzaApiError::RequestFailed {
                method: "content.get".to_string(),
                message: "Network access denied".to_string(),
            })),
            None => Ok(full_post(post_id)),
        }
    }
}

fn full_post(subject: &str) -> FullPost {
    FullPost {
        history: vec![HistoryEntry {
            subject: Some(subject.to_string()),
            content: Some(format!("<p>About {}</p>", subject)),
        }],
        created: "2025-09-15T12:00:00Z".to_string(),
        tags: vec!["general".to_string()],
        post_type: Some("question".to_string()),
        children: vec![],
    }
}

fn saved_post(id: &str, subject: &str) -> SimplifiedPost {
    SimplifiedPost {
        id: id.to_string(),
        subject: subject.to_string(),
        content: "kept from an earlier run".to_string(),
        created: "2025-09-01T08:00:00Z".to_string(),
        tags: vec![],
        post_type: Some("note".to_string()),
        answers: Answers::default(),
    }
}

fn store_in(dir: &Path) -> CheckpointStore {
    CheckpointStore::new(
        dir.join("piazza_data_partial.json"),
        dir.join("piazza_data.json"),
    )
}

fn settings(checkpoint_every: usize) -> HarvestSettings {
    HarvestSettings {
        feed_limit: 5000,
        checkpoint_every,
    }
}

fn harvester_for(
    course: &FakeCourse,
    store: &CheckpointStore,
    checkpoint_every: usize,
) -> Harvester<FakeCourse> {
    Harvester::new(
        course.clone(),
        store.clone(),
        settings(checkpoint_every),
        RetryConfig::default(),
    )
}

fn ids(posts: &[SimplifiedPost]) -> Vec<&str> {
    posts.iter().map(|p| p.id.as_str()).collect()
}

#[tokio::test]
async fn test_resume_fetches_only_missing_posts() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let earlier = vec![saved_post("A", "first"), saved_post("B", "second")];
    store.save_partial(&earlier).await.unwrap();

    let course = FakeCourse::new(&["A", "B", "C"]);
    let mut harvester = harvester_for(&course, &store, 1);
    let report = harvester.run().await.unwrap();

    assert_eq!(course.requested(), vec!["C"]);
    assert_eq!(report.resumed, 2);
    assert_eq!(report.already_fetched, 2);
    assert_eq!(report.fetched, 1);
    assert_eq!(report.total_saved, 3);

    let output = store.load_output().await.unwrap();
    assert_eq!(ids(&output), vec!["A", "B", "C"]);
    assert_eq!(output[..2], earlier[..]);
    assert_eq!(output[2].subject, "C");
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let course = FakeCourse::new(&["A", "B"]);

    harvester_for(&course, &store, 1).run().await.unwrap();
    let first = store.load_output().await.unwrap();

    let report = harvester_for(&course, &store, 1).run().await.unwrap();

    assert_eq!(course.requested(), vec!["A", "B"]);
    assert_eq!(report.fetched, 0);
    assert_eq!(store.load_output().await.unwrap(), first);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_post_is_dropped_and_run_continues() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let course = FakeCourse::new(&["A", "B", "C"]).reply("B", Reply::AlwaysThrottled);

    let mut harvester = harvester_for(&course, &store, 1);
    let report = harvester.run().await.unwrap();

    assert_eq!(course.calls_for("B"), 6);
    assert_eq!(report.dropped, vec!["B".to_string()]);
    assert_eq!(harvester.retry_metrics().exhausted, 1);
    assert_eq!(harvester.retry_metrics().waits.len(), 6);

    let output = store.load_output().await.unwrap();
    assert_eq!(ids(&output), vec!["A", "C"]);
}

#[tokio::test(start_paused = true)]
async fn test_throttled_post_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let course = FakeCourse::new(&["A"]).reply("A", Reply::ThrottledThen(2, full_post("late")));

    let mut harvester = harvester_for(&course, &store, 1);
    let report = harvester.run().await.unwrap();

    assert_eq!(course.calls_for("A"), 3);
    assert_eq!(report.fetched, 1);
    assert!(report.dropped.is_empty());
    assert_eq!(harvester.retry_metrics().successful_retries, 1);
    assert_eq!(store.load_output().await.unwrap()[0].subject, "late");
}

#[tokio::test]
async fn test_fatal_error_keeps_earlier_progress() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let course = FakeCourse::new(&["A", "B", "C"]).reply("B", Reply::Fails);

    let mut harvester = harvester_for(&course, &store, 1);
    let result = harvester.run().await;

    assert!(matches!(
        result,
        Err(CoreError::Piazza(PiazzaApiError::RequestFailed { .. }))
    ));
    assert_eq!(course.requested(), vec!["A", "B"]);
    assert!(harvester.retry_metrics().waits.is_empty());

    let partial = store.load_partial().await.unwrap().unwrap();
    assert_eq!(ids(&partial), vec!["A"]);
    assert!(!store.output_path().exists());
}

#[tokio::test]
async fn test_fatal_error_with_batched_checkpoints_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let course = FakeCourse::new(&["A", "B", "C", "D"]).reply("D", Reply::Fails);

    let mut harvester = harvester_for(&course, &store, 10);
    assert!(harvester.run().await.is_err());

    let partial = store.load_partial().await.unwrap().unwrap();
    assert_eq!(ids(&partial), vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_failed_flush_keeps_the_original_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    // A directory where the temp file should go makes every checkpoint write fail
    std::fs::create_dir(dir.path().join("piazza_data_partial.json.tmp")).unwrap();
    let course = FakeCourse::new(&["A", "B"]).reply("B", Reply::Fails);

    let mut harvester = harvester_for(&course, &store, 10);
    let result = harvester.run().await;

    assert!(matches!(
        result,
        Err(CoreError::Piazza(PiazzaApiError::RequestFailed { .. }))
    ));
    assert!(!store.partial_path().exists());
}

#[tokio::test]
async fn test_final_write_only_mode() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());

    let failing = FakeCourse::new(&["A", "B"]).reply("B", Reply::Fails);
    let mut harvester = harvester_for(&failing, &store, 0);
    assert!(harvester.run().await.is_err());
    assert!(!store.partial_path().exists());

    let course = FakeCourse::new(&["A", "B"]);
    let mut harvester = harvester_for(&course, &store, 0);
    harvester.run().await.unwrap();
    assert_eq!(ids(&store.load_output().await.unwrap()), vec!["A", "B"]);
    assert_eq!(ids(&store.load_partial().await.unwrap().unwrap()), vec!["A", "B"]);
}

#[tokio::test]
async fn test_empty_post_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let mut blank = full_post("blank");
    blank.history.clear();
    let course = FakeCourse::new(&["A", "B"]).reply("A", Reply::Post(blank));

    let report = harvester_for(&course, &store, 1).run().await.unwrap();

    assert_eq!(report.empty, vec!["A".to_string()]);
    assert_eq!(ids(&store.load_output().await.unwrap()), vec!["B"]);
}

#[tokio::test]
async fn test_repeated_feed_entry_fetched_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let course = FakeCourse::new(&["A", "B", "A"]);

    let report = harvester_for(&course, &store, 1).run().await.unwrap();

    assert_eq!(course.requested(), vec!["A", "B"]);
    assert_eq!(report.already_fetched, 1);
    assert_eq!(ids(&store.load_output().await.unwrap()), vec!["A", "B"]);
}

#[tokio::test]
async fn test_feed_limit_bounds_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let course = FakeCourse::new(&["A", "B", "C"]);

    let limited = HarvestSettings {
        feed_limit: 2,
        checkpoint_every: 1,
    };
    let report = Harvester::new(course.clone(), store.clone(), limited, RetryConfig::default())
        .run()
        .await
        .unwrap();

    assert_eq!(report.feed_size, 2);
    assert_eq!(course.requested(), vec!["A", "B"]);
}

#[tokio::test]
async fn test_cancellation_stops_between_posts() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let cancel = CancellationToken::new();
    let mut course = FakeCourse::new(&["A", "B", "C"]);
    course.cancel_after_first = Some(cancel.clone());

    let mut harvester = harvester_for(&course, &store, 1).with_cancellation(cancel);
    let result = harvester.run().await;

    assert!(matches!(result, Err(CoreError::Cancelled)));
    assert_eq!(course.requested(), vec!["A"]);
    assert_eq!(ids(&store.load_partial().await.unwrap().unwrap()), vec!["A"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let store = store_in(dir.path());
    let cancel = CancellationToken::new();
    let mut course = FakeCourse::new(&["A"]).reply("A", Reply::AlwaysThrottled);
    course.cancel_after_first = Some(cancel.clone());

    let mut harvester = harvester_for(&course, &store, 1).with_cancellation(cancel);

    assert!(matches!(harvester.run().await, Err(CoreError::Cancelled)));
    assert_eq!(course.calls_for("A"), 1);
    assert!(!store.output_path().exists());
}
