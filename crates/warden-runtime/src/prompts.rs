//! Judgment prompts and the request builder.
//!
//! Requests are deterministic: the same subject, author context and
//! question set always produce the same payload bytes and fingerprint, so a
//! judgment can be reproduced from the audit trail. The correlation id is
//! the only per-call field and is kept out of the fingerprint.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;

use warden_core::{AuthorProfile, ContentSanitizer, Question, Subject, SubjectId};

use crate::error::AnalysisError;

/// Bumped whenever prompt text or payload layout changes.
pub const PROMPT_VERSION: &str = "2026-01-15.1";

/// Shared preamble for every judgment.
pub const BASE_SYSTEM_PROMPT: &str = r#"
You are a content moderation analyst for an online community.

You assess user-submitted content and answer only what you are asked.
Personal data in the content has been replaced with placeholders such as
[EMAIL] or [PHONE]; do not speculate about the original values.

## Constraints
1. Judge only the content and author context you are given
2. Do not invent policies or categories
3. Respond with a single JSON object and nothing else
4. Confidence is an integer from 0 to 100
"#;

/// Full risk assessment.
pub const RISK_ASSESSMENT_PROMPT: &str = r#"
## Task: Risk Assessment

Assess how likely the content is to violate common community rules
(spam, scams, harassment, sexual solicitation, self-harm, illegal goods).

## Output Format (JSON)
{
  "risk_level": "low" | "medium" | "high" | "critical",
  "confidence": 0-100,
  "categories": ["spam", ...],
  "reasoning": "brief explanation",
  "recommended_action": "approve" | "flag" | "remove" | "comment"
}
"#;

/// Batched yes/no questions.
pub const QUESTION_BATCH_PROMPT: &str = r#"
## Task: Answer Questions

Answer every question in `questions` about the content with YES or NO.
Answer each question independently. Include every question id exactly once.

## Output Format (JSON)
{
  "answers": [
    {
      "question_id": "id from the request",
      "answer": "YES" | "NO",
      "confidence": 0-100,
      "reasoning": "brief explanation"
    }
  ]
}
"#;

/// What the provider is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    RiskAssessment,
    Questions,
}

/// Author fields a provider may see. No username, no history text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthorContext {
    pub account_age_days: i64,
    pub karma: i64,
    pub has_verified_email: bool,
    pub recent_removed_count: usize,
}

impl AuthorContext {
    pub fn from_profile(profile: &AuthorProfile, now: DateTime<Utc>) -> Self {
        Self {
            account_age_days: profile.account_age_days(now),
            karma: profile.total_karma(),
            has_verified_email: profile.has_verified_email,
            recent_removed_count: profile.recent_removed_count(),
        }
    }
}

/// A fully built, provider-agnostic request.
#[derive(Debug, Clone)]
pub struct JudgmentRequest {
    pub correlation_id: String,
    pub subject_id: SubjectId,
    pub kind: RequestKind,
    /// Sorted by id; empty for risk assessments
    pub questions: Vec<Question>,
    pub system_prompt: String,
    /// JSON document sent as the user message
    pub payload: String,
    pub prompt_version: &'static str,
    /// SHA-256 of version, system prompt and payload
    pub fingerprint: String,
}

impl JudgmentRequest {
    pub fn question_ids(&self) -> impl Iterator<Item = &str> {
        self.questions.iter().map(|q| q.id.as_str())
    }
}

#[derive(Serialize)]
struct ContentPayload<'a> {
    subject_id: &'a str,
    content_type: &'a str,
    community: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    body: String,
    has_link: bool,
    author: &'a AuthorContext,
    #[serde(skip_serializing_if = "no_questions")]
    questions: &'a [Question],
}

fn no_questions(questions: &&[Question]) -> bool {
    questions.is_empty()
}

/// Builds [`JudgmentRequest`]s from subjects.
#[derive(Clone)]
pub struct RequestBuilder {
    sanitizer: Arc<dyn ContentSanitizer>,
    max_questions: usize,
}

impl RequestBuilder {
    pub fn new(sanitizer: Arc<dyn ContentSanitizer>, max_questions: usize) -> Self {
        Self {
            sanitizer,
            max_questions,
        }
    }

    /// Sort and de-duplicate questions by id; enforce the batch cap.
    pub fn normalize_questions(&self, questions: &[Question]) -> Result<Vec<Question>, AnalysisError> {
        let unique: BTreeMap<&str, &Question> =
            questions.iter().map(|q| (q.id.as_str(), q)).collect();
        if unique.len() > self.max_questions {
            return Err(AnalysisError::TooManyQuestions {
                count: unique.len(),
                max: self.max_questions,
            });
        }
        Ok(unique.into_values().cloned().collect())
    }

    /// Empty `questions` asks for a full risk assessment.
    pub fn build(
        &self,
        subject: &Subject,
        author: &AuthorContext,
        questions: &[Question],
        correlation_id: &str,
    ) -> Result<JudgmentRequest, AnalysisError> {
        let questions = self.normalize_questions(questions)?;
        let kind = if questions.is_empty() {
            RequestKind::RiskAssessment
        } else {
            RequestKind::Questions
        };

        let content = ContentPayload {
            subject_id: subject.id.as_str(),
            content_type: subject.content_type.as_str(),
            community: &subject.community,
            title: subject
                .title
                .as_deref()
                .map(|t| self.sanitizer.sanitize(t).sanitized_text),
            body: self.sanitizer.sanitize(&subject.body).sanitized_text,
            has_link: subject.url.is_some(),
            author,
            questions: &questions,
        };
        // Serializing plain structs and strings cannot fail
        let payload = serde_json::to_string_pretty(&content).unwrap_or_default();

        let task_prompt = match kind {
            RequestKind::RiskAssessment => RISK_ASSESSMENT_PROMPT,
            RequestKind::Questions => QUESTION_BATCH_PROMPT,
        };
        let system_prompt = format!("{}{}", BASE_SYSTEM_PROMPT.trim_start(), task_prompt);
        let fingerprint = fingerprint(&system_prompt, &payload);

        Ok(JudgmentRequest {
            correlation_id: correlation_id.to_string(),
            subject_id: subject.id.clone(),
            kind,
            questions,
            system_prompt,
            payload,
            prompt_version: PROMPT_VERSION,
            fingerprint,
        })
    }
}

impl std::fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("max_questions", &self.max_questions)
            .finish()
    }
}

fn fingerprint(system_prompt: &str, payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(PROMPT_VERSION.as_bytes());
    hasher.update(b"\n");
    hasher.update(system_prompt.as_bytes());
    hasher.update(b"\n");
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}
