//! The whitelist of fields a rule may reference.
//!
//! Every path is resolved at definition time; an unknown path makes the
//! owning rule uninstallable rather than silently evaluating to false.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::sanitizer::ContentSanitizer;
use crate::types::{AnswerSet, AuthorProfile, ContentType, Subject};

/// A resolved field path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldPath {
    AccountAgeDays,
    Karma,
    LinkKarma,
    CommentKarma,
    HasVerifiedEmail,
    IsVerified,
    RecentPostCount,
    RecentCommentCount,
    RecentRemovedCount,
    ContentType,
    Title,
    Body,
    Text,
    Url,
    HasUrl,
    UrlCount,
    PiiCount,
    Length,
    TrustScore,
    AiAnswer(String),
    AiConfidence(String),
}

/// The value type a field resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Number,
    Bool,
    Text,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueKind::Number => "number",
            ValueKind::Bool => "bool",
            ValueKind::Text => "text",
        })
    }
}

impl FieldPath {
    /// Parse a dotted path. Returns `None` for anything off the whitelist.
    pub fn parse(path: &str) -> Option<Self> {
        let field = match path {
            "profile.account_age_days" => FieldPath::AccountAgeDays,
            "profile.karma" => FieldPath::Karma,
            "profile.link_karma" => FieldPath::LinkKarma,
            "profile.comment_karma" => FieldPath::CommentKarma,
            "profile.has_verified_email" => FieldPath::HasVerifiedEmail,
            "profile.is_verified" => FieldPath::IsVerified,
            "profile.recent_post_count" => FieldPath::RecentPostCount,
            "profile.recent_comment_count" => FieldPath::RecentCommentCount,
            "profile.recent_removed_count" => FieldPath::RecentRemovedCount,
            "content.type" => FieldPath::ContentType,
            "content.title" => FieldPath::Title,
            "content.body" => FieldPath::Body,
            "content.text" => FieldPath::Text,
            "content.url" => FieldPath::Url,
            "content.has_url" => FieldPath::HasUrl,
            "content.url_count" => FieldPath::UrlCount,
            "content.pii_count" => FieldPath::PiiCount,
            "content.length" => FieldPath::Length,
            "trust.score" => FieldPath::TrustScore,
            other => {
                let rest = other.strip_prefix("ai.")?;
                let (question_id, attribute) = rest.rsplit_once('.')?;
                if question_id.is_empty() {
                    return None;
                }
                match attribute {
                    "answer" => FieldPath::AiAnswer(question_id.to_string()),
                    "confidence" => FieldPath::AiConfidence(question_id.to_string()),
                    _ => return None,
                }
            }
        };
        Some(field)
    }

    /// Question id for `ai.*` fields.
    pub fn question_id(&self) -> Option<&str> {
        match self {
            FieldPath::AiAnswer(id) | FieldPath::AiConfidence(id) => Some(id),
            _ => None,
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            FieldPath::AccountAgeDays
            | FieldPath::Karma
            | FieldPath::LinkKarma
            | FieldPath::CommentKarma
            | FieldPath::RecentPostCount
            | FieldPath::RecentCommentCount
            | FieldPath::RecentRemovedCount
            | FieldPath::UrlCount
            | FieldPath::PiiCount
            | FieldPath::Length
            | FieldPath::TrustScore
            | FieldPath::AiConfidence(_) => ValueKind::Number,
            FieldPath::HasVerifiedEmail
            | FieldPath::IsVerified
            | FieldPath::HasUrl
            | FieldPath::AiAnswer(_) => ValueKind::Bool,
            FieldPath::ContentType
            | FieldPath::Title
            | FieldPath::Body
            | FieldPath::Text
            | FieldPath::Url => ValueKind::Text,
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldPath::AccountAgeDays => "profile.account_age_days",
            FieldPath::Karma => "profile.karma",
            FieldPath::LinkKarma => "profile.link_karma",
            FieldPath::CommentKarma => "profile.comment_karma",
            FieldPath::HasVerifiedEmail => "profile.has_verified_email",
            FieldPath::IsVerified => "profile.is_verified",
            FieldPath::RecentPostCount => "profile.recent_post_count",
            FieldPath::RecentCommentCount => "profile.recent_comment_count",
            FieldPath::RecentRemovedCount => "profile.recent_removed_count",
            FieldPath::ContentType => "content.type",
            FieldPath::Title => "content.title",
            FieldPath::Body => "content.body",
            FieldPath::Text => "content.text",
            FieldPath::Url => "content.url",
            FieldPath::HasUrl => "content.has_url",
            FieldPath::UrlCount => "content.url_count",
            FieldPath::PiiCount => "content.pii_count",
            FieldPath::Length => "content.length",
            FieldPath::TrustScore => "trust.score",
            FieldPath::AiAnswer(id) => return write!(f, "ai.{}.answer", id),
            FieldPath::AiConfidence(id) => return write!(f, "ai.{}.confidence", id),
        };
        f.write_str(s)
    }
}

/// A resolved field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Bool(bool),
    Text(String),
    /// The field has no value for this subject (no URL, no trust score,
    /// an answer below the rule's confidence threshold)
    Missing,
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Number(n) if n.fract() == 0.0 => write!(f, "{}", *n as i64),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Text(s) => f.write_str(s),
            FieldValue::Missing => Ok(()),
        }
    }
}

/// Outcome of resolving a field: a value, or unknown because the judgment
/// it depends on has not been obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Value(FieldValue),
    Unknown,
}

/// View of AI answers as seen by one rule.
#[derive(Debug, Clone, Copy)]
pub enum AnswerView<'a> {
    /// Answers not available (pending or unavailable)
    Unknown,
    /// Answers gated by the rule's confidence threshold
    Gated { answers: &'a AnswerSet, threshold: u8 },
}

/// Counts produced by the sanitizer for the subject's text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentSignals {
    /// Links in the text plus the link target of a link post
    pub url_count: usize,
    pub pii_count: usize,
}

impl ContentSignals {
    pub fn from_subject(subject: &Subject, sanitizer: &dyn ContentSanitizer) -> Self {
        let sanitized = sanitizer.sanitize(&subject.text());
        Self {
            url_count: sanitized.url_count + usize::from(subject.url.is_some()),
            pii_count: sanitized.pii_count,
        }
    }
}

/// Everything deterministic rules can see for one subject.
#[derive(Debug, Clone)]
pub struct EvaluationContext<'a> {
    pub subject: &'a Subject,
    pub profile: &'a AuthorProfile,
    /// 0 - 100, absent when the trust collaborator has no score
    pub trust_score: Option<u8>,
    pub signals: ContentSignals,
    pub now: DateTime<Utc>,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(
        subject: &'a Subject,
        profile: &'a AuthorProfile,
        trust_score: Option<u8>,
        signals: ContentSignals,
    ) -> Self {
        Self {
            subject,
            profile,
            trust_score,
            signals,
            now: Utc::now(),
        }
    }

    /// Build a context, deriving content signals with `sanitizer`.
    pub fn with_sanitizer(
        subject: &'a Subject,
        profile: &'a AuthorProfile,
        trust_score: Option<u8>,
        sanitizer: &dyn ContentSanitizer,
    ) -> Self {
        let signals = ContentSignals::from_subject(subject, sanitizer);
        Self::new(subject, profile, trust_score, signals)
    }

    /// Pin the evaluation time (account age is relative to it).
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn resolve(&self, field: &FieldPath, answers: AnswerView<'_>) -> Resolved {
        let value = match field {
            FieldPath::AccountAgeDays => {
                FieldValue::Number(self.profile.account_age_days(self.now) as f64)
            }
            FieldPath::Karma => FieldValue::Number(self.profile.total_karma() as f64),
            FieldPath::LinkKarma => FieldValue::Number(self.profile.link_karma as f64),
            FieldPath::CommentKarma => FieldValue::Number(self.profile.comment_karma as f64),
            FieldPath::HasVerifiedEmail => FieldValue::Bool(self.profile.has_verified_email),
            FieldPath::IsVerified => FieldValue::Bool(self.profile.is_verified),
            FieldPath::RecentPostCount => {
                FieldValue::Number(self.profile.recent_count(ContentType::Post) as f64)
            }
            FieldPath::RecentCommentCount => {
                FieldValue::Number(self.profile.recent_count(ContentType::Comment) as f64)
            }
            FieldPath::RecentRemovedCount => {
                FieldValue::Number(self.profile.recent_removed_count() as f64)
            }
            FieldPath::ContentType => {
                FieldValue::Text(self.subject.content_type.as_str().to_string())
            }
            FieldPath::Title => match &self.subject.title {
                Some(title) => FieldValue::Text(title.clone()),
                None => FieldValue::Missing,
            },
            FieldPath::Body => FieldValue::Text(self.subject.body.clone()),
            FieldPath::Text => FieldValue::Text(self.subject.text()),
            FieldPath::Url => match &self.subject.url {
                Some(url) => FieldValue::Text(url.clone()),
                None => FieldValue::Missing,
            },
            FieldPath::HasUrl => FieldValue::Bool(self.signals.url_count > 0),
            FieldPath::UrlCount => FieldValue::Number(self.signals.url_count as f64),
            FieldPath::PiiCount => FieldValue::Number(self.signals.pii_count as f64),
            FieldPath::Length => FieldValue::Number(self.subject.text().chars().count() as f64),
            FieldPath::TrustScore => match self.trust_score {
                Some(score) => FieldValue::Number(f64::from(score)),
                None => FieldValue::Missing,
            },
            FieldPath::AiAnswer(id) | FieldPath::AiConfidence(id) => {
                let AnswerView::Gated { answers, threshold } = answers else {
                    return Resolved::Unknown;
                };
                match answers.get(id) {
                    Some(answer) if answer.confidence >= threshold => match field {
                        FieldPath::AiAnswer(_) => FieldValue::Bool(answer.answer.as_bool()),
                        _ => FieldValue::Number(f64::from(answer.confidence)),
                    },
                    _ => FieldValue::Missing,
                }
            }
        };
        Resolved::Value(value)
    }
}
