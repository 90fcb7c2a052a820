use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use repopulse_core::SubjectId;
use repopulse_store::SnapshotStore;
use serde::{Deserialize, Serialize};

use crate::{AnalysisError, resolve_window_from};

pub const DEFAULT_TIMELINE_WINDOW: &str = "4m";
pub const DEFAULT_GROUP_BY: GroupBy = GroupBy::Month;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    Week,
    Month,
    Quarter,
}

impl GroupBy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Week => "week",
            Self::Month => "month",
            Self::Quarter => "quarter",
        }
    }

    /// Bucket label for an instant: `W05`, `Jan`, `Q1`.
    pub fn label(self, at: DateTime<Utc>) -> String {
        match self {
            Self::Week => format!("W{:02}", at.iso_week().week()),
            Self::Month => at.format("%b").to_string(),
            Self::Quarter => format!("Q{}", at.month().div_ceil(3)),
        }
    }
}

impl FromStr for GroupBy {
    type Err = AnalysisError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "week" => Ok(Self::Week),
            "month" => Ok(Self::Month),
            "quarter" => Ok(Self::Quarter),
            other => Err(AnalysisError::InvalidGroupBy(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineBucket {
    pub label: String,
    pub commits: i64,
    pub prs: i64,
    pub reviews: i64,
}

pub struct TimelineAggregator<'a> {
    store: &'a dyn SnapshotStore,
}

impl<'a> TimelineAggregator<'a> {
    pub fn new(store: &'a dyn SnapshotStore) -> Self {
        Self { store }
    }

    pub fn build_timeline(
        &self,
        scope_id: SubjectId,
        window: &str,
        group_by: GroupBy,
    ) -> Result<Vec<TimelineBucket>, AnalysisError> {
        self.build_timeline_at(scope_id, window, group_by, Utc::now().date_naive())
    }

    /// Sums the repository's snapshots into buckets, in first-seen order.
    ///
    /// Values are summed rather than differenced, so a bucket holding several
    /// snapshots counts cumulative totals more than once.
    pub fn build_timeline_at(
        &self,
        scope_id: SubjectId,
        window: &str,
        group_by: GroupBy,
        today: NaiveDate,
    ) -> Result<Vec<TimelineBucket>, AnalysisError> {
        let start = resolve_window_from(window, today)?;
        let snapshots = self.store.snapshots_since(scope_id, start)?;
        tracing::debug!(
            scope_id,
            window,
            group_by = group_by.as_str(),
            snapshots = snapshots.len(),
            "building timeline"
        );

        let mut buckets: Vec<TimelineBucket> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        for snapshot in snapshots {
            let label = group_by.label(snapshot.taken_at);
            let index = *positions.entry(label.clone()).or_insert_with(|| {
                buckets.push(TimelineBucket {
                    label,
                    commits: 0,
                    prs: 0,
                    reviews: 0,
                });
                buckets.len() - 1
            });

            let bucket = &mut buckets[index];
            bucket.commits += snapshot.metrics.commits;
            bucket.prs += snapshot.metrics.open_prs;
            bucket.reviews += snapshot.metrics.reviews;
        }

        Ok(buckets)
    }
}
