//! Content sanitizing before text leaves the process.
//!
//! The runtime only ever sends sanitized text to judgment providers.
//! [`ContentSanitizer`] is the contract; [`PatternSanitizer`] is the default
//! implementation used when no external sanitizer is wired in.

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

lazy_static! {
    /// Links, with or without a scheme
    pub static ref URL_PATTERN: Regex = Regex::new(
        r"(?i)\b(?:https?://|www\.)[^\s<>()]+"
    ).unwrap();

    /// Email address pattern (RFC 5322 simplified)
    pub static ref EMAIL_PATTERN: Regex = Regex::new(
        r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}"
    ).unwrap();

    /// Credit card number pattern (16 digits with optional separators)
    pub static ref CREDIT_CARD_PATTERN: Regex = Regex::new(
        r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b"
    ).unwrap();

    /// Social Security Number pattern (XXX-XX-XXXX or XXXXXXXXX)
    pub static ref SSN_PATTERN: Regex = Regex::new(
        r"\b\d{3}[-\s]?\d{2}[-\s]?\d{4}\b"
    ).unwrap();

    /// US phone number pattern (with optional country code)
    pub static ref PHONE_PATTERN: Regex = Regex::new(
        r"(?:\+?1[-.\s]?)?(?:\([0-9]{3}\)|[0-9]{3})[-.\s]?[0-9]{3}[-.\s]?[0-9]{4}"
    ).unwrap();
}

/// Result of sanitizing one piece of text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizedText {
    pub sanitized_text: String,
    pub pii_count: usize,
    pub url_count: usize,
}

/// Strips identifiable substrings from free text.
pub trait ContentSanitizer: Send + Sync {
    fn sanitize(&self, text: &str) -> SanitizedText;
}

/// Regex-based sanitizer.
///
/// Replacement order matters: URLs first (they may contain emails), then
/// card numbers before the shorter digit patterns they would otherwise
/// partially match.
#[derive(Debug, Clone)]
pub struct PatternSanitizer {
    redact_urls: bool,
}

impl PatternSanitizer {
    pub fn new() -> Self {
        Self { redact_urls: false }
    }

    /// Replace links with `[URL]` as well as counting them.
    pub fn redact_urls(mut self, redact: bool) -> Self {
        self.redact_urls = redact;
        self
    }
}

impl Default for PatternSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentSanitizer for PatternSanitizer {
    fn sanitize(&self, text: &str) -> SanitizedText {
        let url_count = URL_PATTERN.find_iter(text).count();
        let mut current = if self.redact_urls {
            URL_PATTERN.replace_all(text, "[URL]").into_owned()
        } else {
            text.to_string()
        };

        let mut pii_count = 0;
        for (pattern, placeholder) in [
            (&*EMAIL_PATTERN, "[EMAIL]"),
            (&*CREDIT_CARD_PATTERN, "[CARD]"),
            (&*SSN_PATTERN, "[SSN]"),
            (&*PHONE_PATTERN, "[PHONE]"),
        ] {
            let replaced = pattern.replace_all(&current, |_: &Captures| {
                pii_count += 1;
                placeholder
            });
            current = replaced.into_owned();
        }

        SanitizedText {
            sanitized_text: current,
            pii_count,
            url_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_and_phone_redacted() {
        let s = PatternSanitizer::new().sanitize("mail me at jane@example.com or 555-123-4567");
        assert_eq!(s.sanitized_text, "mail me at [EMAIL] or [PHONE]");
        assert_eq!(s.pii_count, 2);
        assert_eq!(s.url_count, 0);
    }

    #[test]
    fn test_card_not_split_into_phone() {
        let s = PatternSanitizer::new().sanitize("card 4111-1111-1111-1111 thanks");
        assert_eq!(s.sanitized_text, "card [CARD] thanks");
        assert_eq!(s.pii_count, 1);
    }

    #[test]
    fn test_ssn_redacted() {
        let s = PatternSanitizer::new().sanitize("SSN: 123-45-6789");
        assert_eq!(s.sanitized_text, "SSN: [SSN]");
    }

    #[test]
    fn test_urls_counted_and_optionally_redacted() {
        let text = "see https://spam.example/deal and www.other.example";
        let kept = PatternSanitizer::new().sanitize(text);
        assert_eq!(kept.url_count, 2);
        assert!(kept.sanitized_text.contains("https://spam.example/deal"));

        let redacted = PatternSanitizer::new().redact_urls(true).sanitize(text);
        assert_eq!(redacted.url_count, 2);
        assert_eq!(redacted.sanitized_text, "see [URL] and [URL]");
    }

    #[test]
    fn test_clean_text_unchanged() {
        let s = PatternSanitizer::new().sanitize("nothing to see here");
        assert_eq!(s.sanitized_text, "nothing to see here");
        assert_eq!(s.pii_count, 0);
    }
}
