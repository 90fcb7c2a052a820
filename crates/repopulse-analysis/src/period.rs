use chrono::{DateTime, Days, Utc};
use repopulse_core::{Metric, SubjectId, SubjectKind};
use repopulse_store::SnapshotStore;
use serde::Serialize;

use crate::AnalysisError;

pub const PERIOD_CHANGE_DAYS: u64 = 7;

const PERIOD_METRICS: [Metric; 4] = [
    Metric::Commits,
    Metric::OpenPrs,
    Metric::OpenIssues,
    Metric::Reviews,
];

/// Week-over-week change in percent, one decimal place.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PeriodChange {
    pub commits: f64,
    pub open_prs: f64,
    pub open_issues: f64,
    pub reviews: f64,
}

impl PeriodChange {
    fn set(&mut self, metric: Metric, value: f64) {
        match metric {
            Metric::Commits => self.commits = value,
            Metric::OpenPrs => self.open_prs = value,
            Metric::OpenIssues => self.open_issues = value,
            Metric::Reviews => self.reviews = value,
            Metric::PrsOpened | Metric::MergedPrs => {}
        }
    }
}

pub struct PeriodChangeAnalyzer<'a> {
    store: &'a dyn SnapshotStore,
}

impl<'a> PeriodChangeAnalyzer<'a> {
    pub fn new(store: &'a dyn SnapshotStore) -> Self {
        Self { store }
    }

    /// Compares the latest repository snapshot with the last one taken at
    /// least a week before `now`. Missing or zero baselines report 0.
    pub fn period_change(
        &self,
        repository_id: SubjectId,
        now: DateTime<Utc>,
    ) -> Result<PeriodChange, AnalysisError> {
        let subject = self.store.get_subject(repository_id)?;
        if !subject.is_some_and(|subject| subject.kind == SubjectKind::Repository) {
            return Err(AnalysisError::SubjectNotFound(format!(
                "repository {repository_id}"
            )));
        }

        let current = self.store.latest_snapshot(repository_id, None, None)?;
        let baseline = match now.date_naive().checked_sub_days(Days::new(PERIOD_CHANGE_DAYS)) {
            Some(cutoff) => self
                .store
                .latest_snapshot(repository_id, None, Some(cutoff))?,
            None => None,
        };

        let mut change = PeriodChange::default();
        if let (Some(current), Some(baseline)) = (current, baseline) {
            for metric in PERIOD_METRICS {
                change.set(
                    metric,
                    percent_change(baseline.metrics.get(metric), current.metrics.get(metric)),
                );
            }
        }

        Ok(change)
    }
}

fn percent_change(baseline: i64, current: i64) -> f64 {
    if baseline <= 0 {
        return 0.0;
    }

    let ratio = (current - baseline) as f64 / baseline as f64 * 100.0;
    (ratio * 10.0).round() / 10.0
}
