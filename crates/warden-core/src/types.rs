//! Core data model shared by the rule engine and the runtime.
//!
//! Subjects and profiles are inputs owned by external collaborators; this
//! crate only reads them. Answers are produced by the runtime and are
//! immutable once built.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque, stable identifier of a subject (post or comment).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Kind of content being judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Post,
    Comment,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Post => "post",
            ContentType::Comment => "comment",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The content item being judged. Never mutated by this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,

    pub content_type: ContentType,

    /// Author username
    pub author: String,

    /// Community the content was submitted to
    pub community: String,

    /// Post title (posts only)
    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub body: String,

    /// Link target for link posts
    #[serde(default)]
    pub url: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Subject {
    /// Title and body joined, as seen by a reader.
    pub fn text(&self) -> String {
        match &self.title {
            Some(title) if !self.body.is_empty() => format!("{}\n\n{}", title, self.body),
            Some(title) => title.clone(),
            None => self.body.clone(),
        }
    }
}

/// An item from the author's recent history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentItem {
    pub content_type: ContentType,
    pub community: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub removed: bool,
}

/// Author profile and history, supplied by the profile collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorProfile {
    pub username: String,

    /// Account creation time
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub link_karma: i64,

    #[serde(default)]
    pub comment_karma: i64,

    #[serde(default)]
    pub has_verified_email: bool,

    #[serde(default)]
    pub is_verified: bool,

    #[serde(default)]
    pub recent_items: Vec<RecentItem>,
}

impl AuthorProfile {
    /// Whole days between account creation and `now`, never negative.
    pub fn account_age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days().max(0)
    }

    pub fn total_karma(&self) -> i64 {
        self.link_karma + self.comment_karma
    }

    pub fn recent_count(&self, content_type: ContentType) -> usize {
        self.recent_items
            .iter()
            .filter(|item| item.content_type == content_type)
            .count()
    }

    pub fn recent_removed_count(&self) -> usize {
        self.recent_items.iter().filter(|item| item.removed).count()
    }
}

/// Action chosen for a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Approve,
    Flag,
    Remove,
    Comment,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Approve => "approve",
            Action::Flag => "flag",
            Action::Remove => "remove",
            Action::Comment => "comment",
        };
        f.write_str(s)
    }
}

/// A natural-language question put to a judgment provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// Caller-assigned id, unique within a batch
    pub id: String,

    pub text: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl Question {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Boolean-ish answer to a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Answer {
    Yes,
    No,
}

impl Answer {
    pub fn as_bool(self) -> bool {
        matches!(self, Answer::Yes)
    }

    /// Parse `YES`/`NO` (any case).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "YES" => Some(Answer::Yes),
            "NO" => Some(Answer::No),
            _ => None,
        }
    }
}

/// One provider answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionAnswer {
    pub question_id: String,
    pub answer: Answer,
    /// 0 - 100
    pub confidence: u8,
    pub reasoning: String,
}

/// Answers keyed by question id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnswerSet {
    answers: BTreeMap<String, QuestionAnswer>,
}

impl AnswerSet {
    pub fn new(answers: impl IntoIterator<Item = QuestionAnswer>) -> Self {
        Self {
            answers: answers
                .into_iter()
                .map(|a| (a.question_id.clone(), a))
                .collect(),
        }
    }

    pub fn get(&self, question_id: &str) -> Option<&QuestionAnswer> {
        self.answers.get(question_id)
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QuestionAnswer> {
        self.answers.values()
    }
}

/// Provenance of a judgment, copied onto the decision record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JudgmentMeta {
    pub provider: String,
    pub correlation_id: String,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub cache_hit: bool,
}

/// What the engine knows about AI answers for the current subject.
#[derive(Debug, Clone, Copy)]
pub enum Judgment<'a> {
    /// No call has been made yet
    Pending,

    /// Answers from a call or a cache hit
    Available {
        answers: &'a AnswerSet,
        meta: &'a JudgmentMeta,
    },

    /// No judgment can be obtained (budget, circuit, timeout, failures)
    Unavailable { reason: &'a str },
}
