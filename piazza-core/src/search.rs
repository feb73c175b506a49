//! Keyword ranking over harvested posts.

use crate::types::SimplifiedPost;
use regex::Regex;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::fmt::Write;
use std::sync::LazyLock;

pub const DEFAULT_TOP_K: usize = 10;
const BODY_PREVIEW_CHARS: usize = 1200;

static BREAK_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static BLOCK_CLOSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</(p|div|md)>").unwrap());
static ANY_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").unwrap());
static BLANK_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());
static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9_]+").unwrap());

/// Reduces Piazza's HTML bodies to plain text.
pub fn strip_html(html: &str) -> String {
    let text = BREAK_TAG.replace_all(html, "\n");
    let text = BLOCK_CLOSE.replace_all(&text, "\n");
    let text = ANY_TAG.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&#39;", "'")
        .replace("&quot;", "\"")
        .replace("&amp;", "&");
    BLANK_RUN.replace_all(&text, "\n\n").trim().to_string()
}

pub fn tokenize(text: &str) -> Vec<String> {
    NON_WORD
        .replace_all(&text.to_lowercase(), " ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn searchable_text(post: &SimplifiedPost) -> String {
    let mut text = format!("{} {}", post.subject, strip_html(&post.content));
    for reply in post.answers.instructor.iter().chain(&post.answers.student) {
        text.push(' ');
        text.push_str(&strip_html(reply));
    }
    for followup in &post.answers.followups {
        text.push(' ');
        text.push_str(&strip_html(&followup.content));
        for comment in &followup.comments {
            text.push(' ');
            text.push_str(&strip_html(comment));
        }
    }
    text
}

/// Counts query tokens found anywhere in the post, with small bonuses for a
/// subject match and for a tag mentioned in the query.
pub fn score(post: &SimplifiedPost, query: &str) -> usize {
    let post_tokens: HashSet<String> = tokenize(&searchable_text(post)).into_iter().collect();
    let mut matches = tokenize(query)
        .iter()
        .filter(|token| post_tokens.contains(*token))
        .count();

    let query_lower = query.to_lowercase();
    if post.subject.to_lowercase().contains(&query_lower) {
        matches += 2;
    }
    if post
        .tags
        .iter()
        .any(|tag| query_lower.contains(&tag.to_lowercase()))
    {
        matches += 1;
    }
    matches
}

/// Highest scoring posts first; posts that score zero are dropped.
pub fn pick_top<'a>(
    posts: &'a [SimplifiedPost],
    query: &str,
    k: usize,
) -> Vec<&'a SimplifiedPost> {
    let mut scored: Vec<(usize, &SimplifiedPost)> = posts
        .iter()
        .map(|post| (score(post, query), post))
        .filter(|(s, _)| *s > 0)
        .collect();
    scored.sort_by_key(|(s, _)| Reverse(*s));
    scored.into_iter().take(k).map(|(_, post)| post).collect()
}

/// Plain-text summary of a ranked post.
pub fn context_block(rank: usize, post: &SimplifiedPost) -> String {
    let body: String = strip_html(&post.content)
        .chars()
        .take(BODY_PREVIEW_CHARS)
        .collect();
    let tags = if post.tags.is_empty() {
        "-".to_string()
    } else {
        post.tags.join(", ")
    };

    let mut block = format!(
        "# {}. {} (id: {}, date: {})\nTags: {}\nBody:\n{}",
        rank, post.subject, post.id, post.created, tags, body
    );

    let instructor = non_empty_stripped(&post.answers.instructor);
    if !instructor.is_empty() {
        let _ = write!(block, "\n\nInstructor replies:\n- {}", instructor.join("\n- "));
    }
    let student = non_empty_stripped(&post.answers.student);
    if !student.is_empty() {
        let _ = write!(block, "\n\nStudent replies:\n- {}", student.join("\n- "));
    }
    if !post.answers.followups.is_empty() {
        block.push_str("\n\nFollow-ups:");
        for (idx, followup) in post.answers.followups.iter().enumerate() {
            let _ = write!(
                block,
                "\nFollow-up #{}: {}",
                idx + 1,
                strip_html(&followup.content)
            );
            for comment in non_empty_stripped(&followup.comments) {
                let _ = write!(block, "\n    ↳ {}", comment);
            }
        }
    }
    block
}

fn non_empty_stripped(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|item| strip_html(item))
        .filter(|item| !item.is_empty())
        .collect()
}
