use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use repopulse_analysis::{
    ActivityDeriver, ActivityFeed, AnalysisError, DeltaCalculator, GroupBy, PeriodChange,
    PeriodChangeAnalyzer, RankingEngine, TimelineAggregator,
};
use repopulse_core::{EventType, Metric, Metrics, RepoRef, SubjectId};
use repopulse_store::{
    ContributorRegistration, NewSnapshot, RepositoryRegistration, SnapshotStore, SqliteStore,
};
use tempfile::tempdir;

fn at(month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, month, day, hour, 0, 0)
        .single()
        .expect("valid timestamp")
}

fn day(month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, month, day).expect("valid date")
}

fn contributor(commits: i64, prs_opened: i64, reviews: i64) -> Metrics {
    Metrics {
        commits,
        prs_opened,
        reviews,
        ..Metrics::default()
    }
}

fn register(store: &SqliteStore, logins: &[&str], registered_at: DateTime<Utc>) -> SubjectId {
    store
        .register_repository(&RepositoryRegistration {
            repo: RepoRef::new("octo", "hello"),
            registered_at,
            metrics: Metrics::default(),
            contributors: logins
                .iter()
                .map(|login| ContributorRegistration {
                    login: (*login).to_owned(),
                    metrics: contributor(0, 0, 0),
                })
                .collect(),
        })
        .expect("register repository")
        .repository
        .id
}

fn contributor_snapshot(
    store: &SqliteStore,
    repo_id: SubjectId,
    login: &str,
    taken_at: DateTime<Utc>,
    metrics: Metrics,
) -> i64 {
    let subject = store
        .find_subject(repopulse_core::SubjectKind::Contributor, login)
        .expect("lookup")
        .expect("contributor exists");
    store
        .append_snapshot(NewSnapshot {
            subject_id: subject.id,
            scope_id: Some(repo_id),
            taken_at,
            metrics,
        })
        .expect("append")
        .id
}

fn repository_snapshot(
    store: &SqliteStore,
    repo_id: SubjectId,
    taken_at: DateTime<Utc>,
    metrics: Metrics,
) {
    store
        .append_snapshot(NewSnapshot {
            subject_id: repo_id,
            scope_id: None,
            taken_at,
            metrics,
        })
        .expect("append");
}

fn usernames(list: &[repopulse_analysis::ContributorStanding]) -> Vec<&str> {
    list.iter()
        .map(|entry| entry.github_username.as_str())
        .collect()
}

#[test]
fn windowed_ranking_excludes_members_without_baseline() {
    let temp = tempdir().expect("tempdir");
    let store = SqliteStore::open(temp.path().join("repopulse.sqlite")).expect("open store");

    // carol joins later, so she has no snapshot on or before the window start
    let repo_id = register(&store, &["alice", "bob"], at(5, 1, 9));
    contributor_snapshot(&store, repo_id, "alice", at(6, 14, 9), contributor(12, 3, 1));
    contributor_snapshot(&store, repo_id, "bob", at(6, 14, 9), contributor(20, 1, 4));
    store
        .record_contributor_sync(repo_id, "carol", at(6, 14, 9), contributor(50, 9, 9))
        .expect("carol sync");

    let ranking = RankingEngine::new(&store);
    let windowed = ranking
        .top_performers_at(repo_id, Some("1m"), day(6, 15))
        .expect("windowed ranking");
    assert_eq!(usernames(&windowed.top_committers), vec!["bob", "alice"]);
    assert_eq!(usernames(&windowed.top_prs), vec!["alice", "bob"]);
    assert_eq!(usernames(&windowed.top_reviewers), vec!["bob", "alice"]);

    let all_time = ranking
        .top_performers_at(repo_id, None, day(6, 15))
        .expect("all-time ranking");
    assert_eq!(usernames(&all_time.top_committers), vec!["carol", "bob", "alice"]);
    assert_eq!(all_time.top_committers[0].commits, 50);
}

#[test]
fn ranking_ties_keep_membership_order() {
    let store = SqliteStore::open_in_memory().expect("open store");
    let repo_id = register(&store, &["zoe", "adam", "mia"], at(5, 1, 9));
    for login in ["zoe", "adam", "mia"] {
        contributor_snapshot(&store, repo_id, login, at(6, 1, 9), contributor(4, 0, 0));
    }

    let top = RankingEngine::new(&store)
        .top_performers_at(repo_id, Some("1m"), day(6, 15))
        .expect("ranking");
    assert_eq!(usernames(&top.top_committers), vec!["zoe", "adam", "mia"]);
    assert!(top.top_committers.iter().all(|entry| entry.commits == 4));
}

#[test]
fn invalid_window_fails_ranking_before_members_are_read() {
    let store = SqliteStore::open_in_memory().expect("open store");

    let err = RankingEngine::new(&store)
        .top_performers_at(999, Some("abc"), day(6, 15))
        .expect_err("invalid window");
    assert!(matches!(err, AnalysisError::InvalidWindowFormat(raw) if raw == "abc"));
}

#[test]
fn timeline_sums_snapshots_within_one_iso_week() {
    let store = SqliteStore::open_in_memory().expect("open store");
    let repo_id = register(&store, &[], at(1, 2, 9));

    // Tue, Thu, Sun of ISO week 10 (2024-03-04 .. 2024-03-10)
    for (taken_at, commits, open_prs, reviews) in [
        (at(3, 5, 9), 10, 1, 2),
        (at(3, 7, 9), 11, 2, 3),
        (at(3, 10, 9), 12, 3, 4),
    ] {
        repository_snapshot(
            &store,
            repo_id,
            taken_at,
            Metrics {
                commits,
                open_prs,
                reviews,
                ..Metrics::default()
            },
        );
    }

    let aggregator = TimelineAggregator::new(&store);
    let weekly = aggregator
        .build_timeline_at(repo_id, "1m", GroupBy::Week, day(3, 20))
        .expect("weekly timeline");
    assert_eq!(weekly.len(), 1);
    assert_eq!(weekly[0].label, "W10");
    assert_eq!((weekly[0].commits, weekly[0].prs, weekly[0].reviews), (33, 6, 9));

    let monthly = aggregator
        .build_timeline_at(repo_id, "4m", GroupBy::Month, day(3, 20))
        .expect("monthly timeline");
    assert_eq!(
        monthly
            .iter()
            .map(|bucket| bucket.label.as_str())
            .collect::<Vec<_>>(),
        vec!["Jan", "Mar"]
    );

    let err = aggregator
        .build_timeline_at(repo_id, "4y", GroupBy::Month, day(3, 20))
        .expect_err("invalid window");
    assert!(matches!(err, AnalysisError::InvalidWindowFormat(_)));
}

#[test]
fn quarterly_timeline_keeps_first_seen_order_across_new_year() {
    let store = SqliteStore::open_in_memory().expect("open store");
    let december = |day: u32| {
        Utc.with_ymd_and_hms(2023, 12, day, 9, 0, 0)
            .single()
            .expect("valid timestamp")
    };
    let repo_id = register(&store, &[], december(1));

    for (taken_at, commits) in [(december(20), 5), (at(1, 10, 9), 7), (at(2, 5, 9), 9)] {
        repository_snapshot(
            &store,
            repo_id,
            taken_at,
            Metrics {
                commits,
                ..Metrics::default()
            },
        );
    }

    let quarterly = TimelineAggregator::new(&store)
        .build_timeline_at(repo_id, "3m", GroupBy::Quarter, day(2, 20))
        .expect("quarterly timeline");
    assert_eq!(
        quarterly
            .iter()
            .map(|bucket| (bucket.label.as_str(), bucket.commits))
            .collect::<Vec<_>>(),
        vec![("Q4", 5), ("Q1", 16)]
    );
}

#[test]
fn deriver_emits_only_positive_growth() {
    let store = SqliteStore::open_in_memory().expect("open store");
    let repo_id = register(&store, &["alice", "bob"], at(6, 1, 9));
    contributor_snapshot(&store, repo_id, "alice", at(6, 2, 9), contributor(10, 0, 0));
    contributor_snapshot(&store, repo_id, "alice", at(6, 3, 9), contributor(7, 0, 0));
    contributor_snapshot(&store, repo_id, "bob", at(6, 2, 9), contributor(10, 1, 1));
    contributor_snapshot(&store, repo_id, "bob", at(6, 3, 9), contributor(13, 1, 1));

    let now = at(6, 3, 12);
    let report = ActivityDeriver::new(&store)
        .derive_events(now)
        .expect("derive events");
    assert_eq!(report.pairs_examined, 2);
    assert_eq!(report.pairs_skipped, 0);
    assert_eq!(report.events_written, 1);

    let events = store
        .events_between(repo_id, at(6, 3, 0), at(6, 4, 0))
        .expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].login, "bob");
    assert_eq!(events[0].event_type, EventType::Commit);
    assert_eq!(events[0].quantity, 3);
    assert_eq!(events[0].occurred_at, now);

    let rerun = ActivityDeriver::new(&store)
        .derive_events(at(6, 3, 13))
        .expect("derive again");
    assert_eq!(rerun.events_written, 0);
}

#[test]
fn deriver_skips_pairs_with_a_single_snapshot() {
    let store = SqliteStore::open_in_memory().expect("open store");
    register(&store, &["alice"], at(6, 1, 9));

    let report = ActivityDeriver::new(&store)
        .derive_events(at(6, 1, 12))
        .expect("derive events");
    assert_eq!(report.pairs_examined, 1);
    assert_eq!(report.pairs_skipped, 1);
    assert_eq!(report.events_written, 0);
}

#[test]
fn feed_ranks_todays_events_by_quantity() {
    let store = SqliteStore::open_in_memory().expect("open store");
    let repo_id = register(&store, &["ann", "ben", "cat", "dan"], at(7, 1, 0));

    for (login, commits) in [("ann", 5), ("ben", 1), ("cat", 8)] {
        contributor_snapshot(&store, repo_id, login, at(7, 1, 6), contributor(commits, 0, 0));
    }
    contributor_snapshot(&store, repo_id, "dan", at(7, 1, 6), contributor(40, 0, 0));
    // events derived yesterday stay out of today's feed
    ActivityDeriver::new(&store)
        .derive_events(at(6, 30, 23))
        .expect("derive yesterday");

    let feed = ActivityFeed::new(&store)
        .recent_events(repo_id, at(7, 1, 18))
        .expect("feed");
    assert!(feed.is_empty());

    for (login, commits) in [("ann", 10), ("ben", 2), ("cat", 16)] {
        contributor_snapshot(&store, repo_id, login, at(7, 1, 12), contributor(commits, 0, 0));
    }
    ActivityDeriver::new(&store)
        .derive_events(at(7, 1, 13))
        .expect("derive today");

    let feed = ActivityFeed::new(&store)
        .recent_events(repo_id, at(7, 1, 18))
        .expect("feed");
    assert_eq!(
        feed.iter().map(|entry| entry.quantity).collect::<Vec<_>>(),
        vec![8, 5, 1]
    );
    assert_eq!(
        feed.iter()
            .map(|entry| entry.github_username.as_str())
            .collect::<Vec<_>>(),
        vec!["cat", "ann", "ben"]
    );
    assert!(feed.iter().all(|entry| entry.highlighted));
}

#[test]
fn period_change_compares_against_last_week() {
    let store = SqliteStore::open_in_memory().expect("open store");
    let repo_id = register(&store, &[], at(6, 1, 9));
    repository_snapshot(
        &store,
        repo_id,
        at(6, 7, 9),
        Metrics {
            commits: 200,
            open_prs: 3,
            open_issues: 0,
            reviews: 8,
            ..Metrics::default()
        },
    );
    repository_snapshot(
        &store,
        repo_id,
        at(6, 14, 9),
        Metrics {
            commits: 250,
            open_prs: 2,
            open_issues: 4,
            reviews: 9,
            ..Metrics::default()
        },
    );

    let analyzer = PeriodChangeAnalyzer::new(&store);
    let change = analyzer
        .period_change(repo_id, at(6, 14, 12))
        .expect("period change");
    assert_eq!(
        change,
        PeriodChange {
            commits: 25.0,
            open_prs: -33.3,
            open_issues: 0.0,
            reviews: 12.5,
        }
    );

    let early = analyzer
        .period_change(repo_id, at(6, 3, 12))
        .expect("no baseline yet");
    assert_eq!(early, PeriodChange::default());

    let err = analyzer
        .period_change(4242, at(6, 14, 12))
        .expect_err("unknown repository");
    assert!(matches!(err, AnalysisError::SubjectNotFound(_)));
}

#[test]
fn scoped_contributor_delta_uses_scope_history() {
    let store = SqliteStore::open_in_memory().expect("open store");
    let repo_id = register(&store, &["alice"], at(5, 1, 9));
    contributor_snapshot(&store, repo_id, "alice", at(6, 10, 9), contributor(9, 2, 1));

    let delta = DeltaCalculator::new(&store)
        .contributor_stats("alice", Some("1m"), Some(repo_id), None, day(6, 15))
        .expect("contributor delta");
    assert_eq!(delta.stats()[&Metric::Commits], 9);
    assert_eq!(delta.stats()[&Metric::PrsOpened], 2);
    assert_eq!(delta.stats().len(), 3);
}
