use chrono::{DateTime, NaiveDate, Utc};
use repopulse_core::{MetricMap, RepoRef, SubjectId, SubjectKind, UserId};
use repopulse_store::{SnapshotRecord, SnapshotStore, SubjectRecord};
use serde::Serialize;

use crate::{AnalysisError, resolve_window_from};

/// Either the latest totals or the change across a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DeltaResult {
    Totals {
        date: DateTime<Utc>,
        stats: MetricMap,
    },
    Window {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        stats: MetricMap,
    },
}

impl DeltaResult {
    pub fn stats(&self) -> &MetricMap {
        match self {
            Self::Totals { stats, .. } | Self::Window { stats, .. } => stats,
        }
    }
}

pub struct DeltaCalculator<'a> {
    store: &'a dyn SnapshotStore,
}

impl<'a> DeltaCalculator<'a> {
    pub fn new(store: &'a dyn SnapshotStore) -> Self {
        Self { store }
    }

    pub fn compute_delta(
        &self,
        subject_id: SubjectId,
        scope_id: Option<SubjectId>,
        window: Option<&str>,
    ) -> Result<DeltaResult, AnalysisError> {
        self.compute_delta_at(subject_id, scope_id, window, Utc::now().date_naive())
    }

    pub fn compute_delta_at(
        &self,
        subject_id: SubjectId,
        scope_id: Option<SubjectId>,
        window: Option<&str>,
        today: NaiveDate,
    ) -> Result<DeltaResult, AnalysisError> {
        let subject = self
            .store
            .get_subject(subject_id)?
            .ok_or_else(|| AnalysisError::SubjectNotFound(format!("subject {subject_id}")))?;

        let latest = self
            .store
            .latest_snapshot(subject_id, scope_id, None)?
            .ok_or(AnalysisError::NoSnapshotAvailable)?;

        let start = resolve_start(window, today)?;
        window_delta(self.store, &subject, scope_id, latest, start)
    }

    /// Stats for a tracked repository looked up by its GitHub URL.
    pub fn repository_stats(
        &self,
        repo_url: &str,
        window: Option<&str>,
        today: NaiveDate,
    ) -> Result<DeltaResult, AnalysisError> {
        let not_found = || AnalysisError::SubjectNotFound(format!("repository '{repo_url}'"));

        let repo = RepoRef::parse_url(repo_url).map_err(|_| not_found())?;
        let subject = self
            .store
            .find_subject(SubjectKind::Repository, &repo.full_name())?
            .ok_or_else(not_found)?;

        self.compute_delta_at(subject.id, None, window, today)
    }

    /// Stats for a contributor, either within one repository or across all of
    /// the repositories they have snapshots in.
    ///
    /// When both `repository_id` and `user_id` are given the user must control
    /// the repository.
    pub fn contributor_stats(
        &self,
        username: &str,
        window: Option<&str>,
        repository_id: Option<SubjectId>,
        user_id: Option<UserId>,
        today: NaiveDate,
    ) -> Result<DeltaResult, AnalysisError> {
        let contributor = self
            .store
            .find_subject(SubjectKind::Contributor, username)?
            .ok_or_else(|| AnalysisError::SubjectNotFound(format!("contributor '{username}'")))?;

        if let (Some(repository_id), Some(user_id)) = (repository_id, user_id) {
            if !self.store.user_controls_repository(user_id, repository_id)? {
                return Err(AnalysisError::OwnershipDenied {
                    user_id,
                    repository_id,
                });
            }
        }

        let Some(repository_id) = repository_id else {
            return self.across_scopes(&contributor, window, today);
        };

        let latest = self
            .store
            .latest_snapshot(contributor.id, Some(repository_id), None)?
            .ok_or(AnalysisError::NoSnapshotAvailable)?;
        let start = resolve_start(window, today)?;
        window_delta(self.store, &contributor, Some(repository_id), latest, start)
    }

    /// One delta per scope the contributor has snapshots in, summed. Snapshots
    /// from different repositories are never subtracted from each other; with
    /// a window, scopes without a baseline are left out.
    fn across_scopes(
        &self,
        contributor: &SubjectRecord,
        window: Option<&str>,
        today: NaiveDate,
    ) -> Result<DeltaResult, AnalysisError> {
        let mut latest_per_scope = Vec::new();
        for scope_id in self.store.snapshot_scopes(contributor.id)? {
            if let Some(latest) = self.store.latest_snapshot(contributor.id, scope_id, None)? {
                latest_per_scope.push((scope_id, latest));
            }
        }
        if latest_per_scope.is_empty() {
            return Err(AnalysisError::NoSnapshotAvailable);
        }

        let start = resolve_start(window, today)?;
        let mut combined: Option<DeltaResult> = None;
        for (scope_id, latest) in latest_per_scope {
            let delta = match window_delta(self.store, contributor, scope_id, latest, start) {
                Ok(delta) => delta,
                Err(AnalysisError::NoBaselineSnapshot) => continue,
                Err(err) => return Err(err),
            };
            combined = Some(match combined {
                Some(total) => merge(total, delta),
                None => delta,
            });
        }

        combined.ok_or(AnalysisError::NoBaselineSnapshot)
    }
}

pub(crate) fn resolve_start(
    window: Option<&str>,
    today: NaiveDate,
) -> Result<Option<NaiveDate>, AnalysisError> {
    window
        .map(|expression| resolve_window_from(expression, today))
        .transpose()
}

/// Totals when `start` is absent, otherwise `latest - earlier` where `earlier`
/// is the last snapshot on or before `start`.
pub(crate) fn window_delta(
    store: &dyn SnapshotStore,
    subject: &SubjectRecord,
    scope_id: Option<SubjectId>,
    latest: SnapshotRecord,
    start: Option<NaiveDate>,
) -> Result<DeltaResult, AnalysisError> {
    let Some(start) = start else {
        return Ok(totals(subject, &latest));
    };

    let earlier = store
        .latest_snapshot(subject.id, scope_id, Some(start))?
        .ok_or(AnalysisError::NoBaselineSnapshot)?;

    Ok(windowed(subject, &earlier, &latest))
}

fn totals(subject: &SubjectRecord, latest: &SnapshotRecord) -> DeltaResult {
    DeltaResult::Totals {
        date: latest.taken_at,
        stats: latest.metrics.for_kind(subject.kind),
    }
}

fn windowed(
    subject: &SubjectRecord,
    earlier: &SnapshotRecord,
    latest: &SnapshotRecord,
) -> DeltaResult {
    DeltaResult::Window {
        from: earlier.taken_at,
        to: latest.taken_at,
        stats: (latest.metrics - earlier.metrics).for_kind(subject.kind),
    }
}

/// Adds two results of the same shape, widening the covered time span.
fn merge(total: DeltaResult, next: DeltaResult) -> DeltaResult {
    match (total, next) {
        (
            DeltaResult::Totals { date, mut stats },
            DeltaResult::Totals {
                date: next_date,
                stats: next_stats,
            },
        ) => {
            add_stats(&mut stats, &next_stats);
            DeltaResult::Totals {
                date: date.max(next_date),
                stats,
            }
        }
        (
            DeltaResult::Window { from, to, mut stats },
            DeltaResult::Window {
                from: next_from,
                to: next_to,
                stats: next_stats,
            },
        ) => {
            add_stats(&mut stats, &next_stats);
            DeltaResult::Window {
                from: from.min(next_from),
                to: to.max(next_to),
                stats,
            }
        }
        // every scope shares one start, so shapes always agree
        (total, _) => total,
    }
}

fn add_stats(stats: &mut MetricMap, other: &MetricMap) {
    for (metric, value) in other {
        *stats.entry(*metric).or_default() += value;
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use repopulse_core::{Metric, Metrics};
    use repopulse_store::{
        ContributorRegistration, NewSnapshot, RepositoryRegistration, SqliteStore,
    };

    use super::*;

    fn at(month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, month, day, 10, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 15).expect("date")
    }

    fn repo_metrics(commits: i64, open_issues: i64) -> Metrics {
        Metrics {
            commits,
            open_issues,
            ..Metrics::default()
        }
    }

    fn seeded() -> (SqliteStore, SubjectId, SubjectId) {
        let store = SqliteStore::open_in_memory().expect("open store");
        let registered = store
            .register_repository(&RepositoryRegistration {
                repo: RepoRef::new("octo", "hello"),
                registered_at: at(5, 1),
                metrics: repo_metrics(100, 12),
                contributors: vec![ContributorRegistration {
                    login: "alice".to_owned(),
                    metrics: Metrics {
                        commits: 10,
                        prs_opened: 2,
                        reviews: 1,
                        ..Metrics::default()
                    },
                }],
            })
            .expect("register");
        let repo_id = registered.repository.id;
        let alice_id = registered.contributors[0].id;

        store
            .append_snapshot(NewSnapshot {
                subject_id: repo_id,
                scope_id: None,
                taken_at: at(6, 14),
                metrics: repo_metrics(130, 9),
            })
            .expect("append");

        (store, repo_id, alice_id)
    }

    #[test]
    fn totals_are_restricted_to_the_subject_metric_set() {
        let (store, repo_id, _) = seeded();
        let calculator = DeltaCalculator::new(&store);

        let result = calculator
            .compute_delta_at(repo_id, None, None, today())
            .expect("totals");

        match &result {
            DeltaResult::Totals { date, stats } => {
                assert_eq!(*date, at(6, 14));
                assert_eq!(stats[&Metric::Commits], 130);
                assert!(!stats.contains_key(&Metric::PrsOpened));
            }
            other => panic!("expected totals, got {other:?}"),
        }
    }

    #[test]
    fn window_delta_keeps_negative_values() {
        let (store, repo_id, _) = seeded();
        let calculator = DeltaCalculator::new(&store);

        let result = calculator
            .compute_delta_at(repo_id, None, Some("1m"), today())
            .expect("delta");

        assert_eq!(
            result,
            DeltaResult::Window {
                from: at(5, 1),
                to: at(6, 14),
                stats: (repo_metrics(130, 9) - repo_metrics(100, 12))
                    .for_kind(SubjectKind::Repository),
            }
        );
        assert_eq!(result.stats()[&Metric::OpenIssues], -3);
    }

    #[test]
    fn same_snapshot_on_both_ends_gives_zero_delta() {
        let (store, repo_id, _) = seeded();
        let calculator = DeltaCalculator::new(&store);

        let result = calculator
            .compute_delta_at(repo_id, None, Some("0d"), today())
            .expect("delta");
        assert!(result.stats().values().all(|value| *value == 0));
    }

    #[test]
    fn missing_history_is_reported_as_pending() {
        let (store, repo_id, alice_id) = seeded();
        let calculator = DeltaCalculator::new(&store);

        let baseline = calculator
            .compute_delta_at(repo_id, None, Some("3m"), today())
            .expect_err("no baseline three months back");
        assert!(matches!(baseline, AnalysisError::NoBaselineSnapshot));
        assert!(baseline.is_pending());

        let latest = calculator
            .compute_delta_at(alice_id, None, None, today())
            .expect_err("alice has no unscoped snapshots");
        assert!(matches!(latest, AnalysisError::NoSnapshotAvailable));
        assert!(latest.is_pending());
    }

    #[test]
    fn missing_latest_wins_over_an_invalid_window() {
        let (store, _, alice_id) = seeded();
        let calculator = DeltaCalculator::new(&store);

        let err = calculator
            .compute_delta_at(alice_id, None, Some("5y"), today())
            .expect_err("no snapshot");
        assert!(matches!(err, AnalysisError::NoSnapshotAvailable));
    }

    #[test]
    fn repository_stats_look_up_by_url() {
        let (store, _, _) = seeded();
        let calculator = DeltaCalculator::new(&store);

        let result = calculator
            .repository_stats("https://github.com/octo/hello/", Some("2w"), today())
            .expect("stats");
        assert_eq!(result.stats()[&Metric::Commits], 30);

        let err = calculator
            .repository_stats("https://github.com/octo/unknown", None, today())
            .expect_err("not tracked");
        assert!(matches!(err, AnalysisError::SubjectNotFound(_)));

        let err = calculator
            .repository_stats("not a url", None, today())
            .expect_err("not a url");
        assert!(matches!(err, AnalysisError::SubjectNotFound(_)));
    }

    #[test]
    fn contributor_stats_enforce_repository_ownership() {
        let (store, repo_id, _) = seeded();
        let owner = store
            .create_user("dana", &["octo".to_owned()], at(5, 1))
            .expect("user");
        let outsider = store
            .create_user("erin", &["elsewhere".to_owned()], at(5, 1))
            .expect("user");
        let calculator = DeltaCalculator::new(&store);

        let scoped = calculator
            .contributor_stats("alice", None, Some(repo_id), Some(owner.id), today())
            .expect("owner sees stats");
        assert_eq!(scoped.stats()[&Metric::PrsOpened], 2);

        let err = calculator
            .contributor_stats("alice", None, Some(repo_id), Some(outsider.id), today())
            .expect_err("outsider denied");
        assert!(matches!(err, AnalysisError::OwnershipDenied { .. }));

        let across = calculator
            .contributor_stats("alice", None, None, None, today())
            .expect("unscoped lookup");
        assert_eq!(across.stats()[&Metric::Commits], 10);

        let err = calculator
            .contributor_stats("nobody", None, None, None, today())
            .expect_err("unknown contributor");
        assert!(matches!(err, AnalysisError::SubjectNotFound(_)));
    }

    #[test]
    fn unscoped_contributor_stats_sum_per_repository_deltas() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let register = |name: &str, registered_at: DateTime<Utc>, commits: i64| {
            store
                .register_repository(&RepositoryRegistration {
                    repo: RepoRef::new("octo", name),
                    registered_at,
                    metrics: repo_metrics(0, 0),
                    contributors: vec![ContributorRegistration {
                        login: "alice".to_owned(),
                        metrics: Metrics {
                            commits,
                            ..Metrics::default()
                        },
                    }],
                })
                .expect("register")
                .repository
                .id
        };
        let big = register("big", at(1, 1), 100);
        let small = register("small", at(3, 1), 2);
        let commits = |value: i64| Metrics {
            commits: value,
            ..Metrics::default()
        };
        store
            .record_contributor_sync(small, "alice", at(6, 1), commits(5))
            .expect("sync small");
        store
            .record_contributor_sync(big, "alice", at(6, 10), commits(110))
            .expect("sync big");
        let calculator = DeltaCalculator::new(&store);

        let totals = calculator
            .contributor_stats("alice", None, None, None, today())
            .expect("totals");
        match &totals {
            DeltaResult::Totals { date, stats } => {
                assert_eq!(*date, at(6, 10));
                assert_eq!(stats[&Metric::Commits], 115);
            }
            other => panic!("expected totals, got {other:?}"),
        }

        let window = calculator
            .contributor_stats("alice", Some("3m"), None, None, today())
            .expect("window");
        assert_eq!(
            window,
            DeltaResult::Window {
                from: at(1, 1),
                to: at(6, 10),
                stats: commits(13).for_kind(SubjectKind::Contributor),
            }
        );

        // only `big` has a baseline four months back
        let older = calculator
            .contributor_stats("alice", Some("4m"), None, None, today())
            .expect("older window");
        assert_eq!(older.stats()[&Metric::Commits], 10);

        let err = calculator
            .contributor_stats("alice", Some("6m"), None, None, today())
            .expect_err("no baseline anywhere");
        assert!(matches!(err, AnalysisError::NoBaselineSnapshot));
    }
}
