mod github;
mod registration;
mod source;
mod sync;

use repopulse_analysis::AnalysisError;
use repopulse_core::{CoreError, UserId};
use repopulse_store::StoreError;
use thiserror::Error;

pub use github::{GithubMetricsSource, next_page_url};
pub use registration::register_repository;
pub use source::{MetricsSource, SourceError, StaticMetricsSource};
pub use sync::{SyncReport, run_sync_cycle};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    InvalidRepositoryUrl(#[from] CoreError),
    #[error("unknown user {0}")]
    UnknownUser(UserId),
    #[error("repository '{0}' has already been added")]
    AlreadyTracked(String),
    #[error("repository '{0}' is already tracked by another user")]
    TrackedByAnotherUser(String),
    #[error("user {user_id} may not add repositories for owner '{owner}'")]
    OwnershipDenied { user_id: UserId, owner: String },
    #[error("upstream request failed: {0}")]
    Upstream(#[from] SourceError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("analysis error: {0}")]
    Analysis(#[from] AnalysisError),
}

impl IngestError {
    /// Failures of the metrics source are worth retrying later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream(_))
    }
}
