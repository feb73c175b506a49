//! JSON file store for harvested posts.
//!
//! Two slots: the partial checkpoint, rewritten as the harvest makes progress
//! and read once at startup, and the final output, written when the harvest
//! completes. Both hold a pretty-printed JSON array of [`SimplifiedPost`].
//! Writes go to a sibling temp file first and are renamed into place, so a
//! crash mid-write leaves the previous contents intact.

use piazza_core::{CoreError, SimplifiedPost};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    partial_path: PathBuf,
    output_path: PathBuf,
}

impl CheckpointStore {
    pub fn new(partial_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            partial_path: partial_path.into(),
            output_path: output_path.into(),
        }
    }

    pub fn partial_path(&self) -> &Path {
        &self.partial_path
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    /// Posts saved by an earlier run, or `None` if there is no checkpoint.
    pub async fn load_partial(&self) -> Result<Option<Vec<SimplifiedPost>>, CoreError> {
        if !fs::try_exists(&self.partial_path).await? {
            return Ok(None);
        }
        let posts = read_posts(&self.partial_path).await?;
        info!(
            "Loaded {} posts from checkpoint {}",
            posts.len(),
            self.partial_path.display()
        );
        Ok(Some(posts))
    }

    pub async fn save_partial(&self, posts: &[SimplifiedPost]) -> Result<(), CoreError> {
        write_posts(&self.partial_path, posts).await?;
        debug!("Checkpoint saved ({} posts)", posts.len());
        Ok(())
    }

    pub async fn load_output(&self) -> Result<Vec<SimplifiedPost>, CoreError> {
        read_posts(&self.output_path).await
    }

    pub async fn save_output(&self, posts: &[SimplifiedPost]) -> Result<(), CoreError> {
        write_posts(&self.output_path, posts).await?;
        info!(
            "Wrote {} posts to {}",
            posts.len(),
            self.output_path.display()
        );
        Ok(())
    }
}

async fn read_posts(path: &Path) -> Result<Vec<SimplifiedPost>, CoreError> {
    let bytes = fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn write_posts(path: &Path, posts: &[SimplifiedPost]) -> Result<(), CoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }

    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    let mut bytes = serde_json::to_vec_pretty(posts)?;
    bytes.push(b'\n');
    fs::write(&temp_path, &bytes).await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}

/// Posts collected so far and the ids they cover.
#[derive(Debug, Default)]
pub struct ResumeState {
    posts: Vec<SimplifiedPost>,
    fetched_ids: HashSet<String>,
}

impl ResumeState {
    /// Builds the resume set from a checkpoint. Repeated ids keep their first
    /// occurrence.
    pub fn from_posts(posts: Vec<SimplifiedPost>) -> Self {
        let mut state = Self::default();
        for post in posts {
            if state.contains(&post.id) {
                warn!("Checkpoint lists post {} more than once, keeping the first", post.id);
                continue;
            }
            state.push(post);
        }
        state
    }

    pub fn contains(&self, post_id: &str) -> bool {
        self.fetched_ids.contains(post_id)
    }

    pub fn push(&mut self, post: SimplifiedPost) {
        self.fetched_ids.insert(post.id.clone());
        self.posts.push(post);
    }

    pub fn posts(&self) -> &[SimplifiedPost] {
        &self.posts
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }
}
