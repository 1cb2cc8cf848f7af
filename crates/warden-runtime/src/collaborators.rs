//! Contracts for the systems around the moderation pipeline.
//!
//! Profiles, trust scores and action side effects belong to the host
//! platform. The pipeline only reads the first two and hands decisions to
//! the third; none of them are implemented here.

use async_trait::async_trait;
use thiserror::Error;

use warden_core::{AuthorProfile, Decision, Subject};

/// Errors reported by a collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("Collaborator failed: {0}")]
    Failed(String),
}

/// Author profile and recent history.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn profile(&self, username: &str) -> Result<AuthorProfile, CollaboratorError>;
}

/// Trust score per (author, community).
#[async_trait]
pub trait TrustScoreSource: Send + Sync {
    /// 0 - 100, or `None` when the author has no score yet.
    async fn trust_score(
        &self,
        username: &str,
        community: &str,
    ) -> Result<Option<u8>, CollaboratorError>;
}

/// Carries out a decision on the platform (remove, flag, comment).
///
/// `decision.message` is already rendered; the executor owns every
/// platform-specific detail.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, subject: &Subject, decision: &Decision) -> Result<(), CollaboratorError>;
}

/// A trust source for deployments without trust scores.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTrustScores;

#[async_trait]
impl TrustScoreSource for NoTrustScores {
    async fn trust_score(&self, _: &str, _: &str) -> Result<Option<u8>, CollaboratorError> {
        Ok(None)
    }
}
