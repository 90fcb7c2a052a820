mod activity;
mod delta;
mod period;
mod ranking;
mod timeline;
mod window;

use repopulse_core::{SubjectId, UserId};
use repopulse_store::StoreError;
use thiserror::Error;

pub use activity::{ActivityDeriver, ActivityFeed, DerivationReport, FeedEntry, FEED_LIMIT};
pub use delta::{DeltaCalculator, DeltaResult};
pub use period::{PERIOD_CHANGE_DAYS, PeriodChange, PeriodChangeAnalyzer};
pub use ranking::{ContributorStanding, RANKING_LIMIT, RankingEngine, TopPerformers};
pub use timeline::{
    DEFAULT_GROUP_BY, DEFAULT_TIMELINE_WINDOW, GroupBy, TimelineAggregator, TimelineBucket,
};
pub use window::{TimeWindow, WindowUnit, resolve_window, resolve_window_from};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("invalid time_window '{0}', expected <N>d, <N>w or <N>m")]
    InvalidWindowFormat(String),
    #[error("invalid group_by '{0}', expected one of: week, month, quarter")]
    InvalidGroupBy(String),
    #[error("{0} not found")]
    SubjectNotFound(String),
    #[error("no snapshot data available")]
    NoSnapshotAvailable,
    #[error("no snapshot found at or before start of time window")]
    NoBaselineSnapshot,
    #[error("user {user_id} does not control repository {repository_id}")]
    OwnershipDenied {
        user_id: UserId,
        repository_id: SubjectId,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl AnalysisError {
    /// True when the request was valid but history is too short to answer it.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::NoSnapshotAvailable | Self::NoBaselineSnapshot)
    }
}
