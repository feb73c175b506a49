use serde::{Deserialize, Serialize};

/// Entry in a course feed. Only the id is consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostSummary {
    pub id: String,
}

/// One revision of a post or child.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Reply attached to a post: an instructor or student answer, a followup,
/// or a comment nested under a followup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostChild {
    #[serde(rename = "type", default)]
    pub child_type: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub children: Vec<PostChild>,
}

/// Full detail record as returned by `content.get`. Fields the harvest does
/// not use are ignored on decode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullPost {
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub created: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "type", default)]
    pub post_type: Option<String>,
    #[serde(default)]
    pub children: Vec<PostChild>,
}

impl FullPost {
    /// A record without any revision carries nothing worth keeping.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Followup {
    pub content: String,
    pub comments: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answers {
    pub instructor: Vec<String>,
    pub student: Vec<String>,
    pub followups: Vec<Followup>,
}

/// The persisted unit written to the checkpoint and output files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimplifiedPost {
    pub id: String,
    pub subject: String,
    pub content: String,
    pub created: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "type", default)]
    pub post_type: Option<String>,
    #[serde(default)]
    pub answers: Answers,
}

pub const INSTRUCTOR_ANSWER: &str = "i_answer";
pub const STUDENT_ANSWER: &str = "s_answer";
pub const FOLLOWUP: &str = "followup";

impl SimplifiedPost {
    /// Reshapes a fetched post. Returns `None` when the post has no history.
    pub fn from_full(id: &str, post: &FullPost) -> Option<Self> {
        let first = post.history.first()?;

        let answers = Answers {
            instructor: answers_of_type(&post.children, INSTRUCTOR_ANSWER),
            student: answers_of_type(&post.children, STUDENT_ANSWER),
            followups: post
                .children
                .iter()
                .filter(|child| child.child_type.as_deref() == Some(FOLLOWUP))
                .map(|followup| Followup {
                    content: discussion_text(followup),
                    comments: followup.children.iter().map(discussion_text).collect(),
                })
                .collect(),
        };

        Some(Self {
            id: id.to_string(),
            subject: first.subject.clone().unwrap_or_default(),
            content: first.content.clone().unwrap_or_default(),
            created: post.created.clone(),
            tags: post.tags.clone(),
            post_type: post.post_type.clone(),
            answers,
        })
    }
}

fn answers_of_type(children: &[PostChild], child_type: &str) -> Vec<String> {
    children
        .iter()
        .filter(|child| child.child_type.as_deref() == Some(child_type))
        .map(answer_text)
        .collect()
}

// Answers keep their body in `content` on older payloads and in the latest
// history revision on newer ones.
fn answer_text(child: &PostChild) -> String {
    child
        .content
        .clone()
        .or_else(|| child.history.first().and_then(|h| h.content.clone()))
        .unwrap_or_default()
}

// Followups and comments: subject, then content, then empty.
fn discussion_text(child: &PostChild) -> String {
    [child.subject.as_deref(), child.content.as_deref()]
        .into_iter()
        .flatten()
        .find(|text| !text.is_empty())
        .unwrap_or_default()
        .to_string()
}
