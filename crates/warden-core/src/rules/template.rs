//! Message templates with `{field.path}` placeholders.
//!
//! Placeholders resolve against the same field model conditions use, so a
//! template can only name whitelisted fields. `{{` and `}}` are literal
//! braces.

use std::collections::BTreeSet;

use super::definition::RuleError;
use super::field::{AnswerView, EvaluationContext, FieldPath, Resolved};

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Field(FieldPath),
}

/// A compiled message template.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageTemplate {
    segments: Vec<Segment>,
}

impl MessageTemplate {
    pub fn compile(
        source: &str,
        rule_id: &str,
        declared_questions: &BTreeSet<String>,
    ) -> Result<Self, RuleError> {
        let invalid = |detail: String| RuleError::InvalidTemplate {
            rule_id: rule_id.to_string(),
            detail,
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        name.push(c);
                    }
                    if !closed {
                        return Err(invalid(format!("unclosed placeholder '{{{}'", name)));
                    }
                    let name = name.trim();
                    let field = FieldPath::parse(name)
                        .ok_or_else(|| invalid(format!("unknown placeholder '{{{}}}'", name)))?;
                    if let Some(question_id) = field.question_id() {
                        if !declared_questions.contains(question_id) {
                            return Err(RuleError::UnknownQuestion {
                                rule_id: rule_id.to_string(),
                                question_id: question_id.to_string(),
                            });
                        }
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(field));
                }
                '}' => return Err(invalid("unmatched '}'".to_string())),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Render against a context. Missing and unknown fields render empty.
    pub fn render(&self, ctx: &EvaluationContext<'_>, answers: AnswerView<'_>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(s) => out.push_str(s),
                Segment::Field(field) => {
                    if let Resolved::Value(value) = ctx.resolve(field, answers) {
                        out.push_str(&value.to_string());
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::field::ContentSignals;
    use crate::types::{AuthorProfile, ContentType, Subject, SubjectId};
    use chrono::{Duration, Utc};

    fn fixtures() -> (Subject, AuthorProfile) {
        let now = Utc::now();
        (
            Subject {
                id: SubjectId::new("t3_x"),
                content_type: ContentType::Post,
                author: "spammer".to_string(),
                community: "deals".to_string(),
                title: Some("hello".to_string()),
                body: String::new(),
                url: None,
                created_at: now,
            },
            AuthorProfile {
                username: "spammer".to_string(),
                created_at: now - Duration::days(3),
                link_karma: 1,
                comment_karma: 1,
                has_verified_email: false,
                is_verified: false,
                recent_items: vec![],
            },
        )
    }

    #[test]
    fn test_render_fields() {
        let (s, p) = fixtures();
        let ctx = EvaluationContext::new(&s, &p, Some(12), ContentSignals::default());
        let t = MessageTemplate::compile(
            "Account is {profile.account_age_days} days old, trust {trust.score}.",
            "R1",
            &BTreeSet::new(),
        )
        .unwrap();
        assert_eq!(
            t.render(&ctx, AnswerView::Unknown),
            "Account is 3 days old, trust 12."
        );
    }

    #[test]
    fn test_escaped_braces_and_missing_values() {
        let (s, p) = fixtures();
        let ctx = EvaluationContext::new(&s, &p, None, ContentSignals::default());
        let t = MessageTemplate::compile("{{raw}} url=[{content.url}]", "R1", &BTreeSet::new())
            .unwrap();
        assert_eq!(t.render(&ctx, AnswerView::Unknown), "{raw} url=[]");
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let err = MessageTemplate::compile("hi {profile.nope}", "R7", &BTreeSet::new())
            .unwrap_err();
        assert!(matches!(err, RuleError::InvalidTemplate { ref rule_id, .. } if rule_id == "R7"));
    }

    #[test]
    fn test_unclosed_placeholder_rejected() {
        assert!(MessageTemplate::compile("hi {profile.karma", "R1", &BTreeSet::new()).is_err());
        assert!(MessageTemplate::compile("hi }", "R1", &BTreeSet::new()).is_err());
    }
}
