use chrono::{DateTime, Utc};
use repopulse_core::{RepoRef, SubjectKind, UserId};
use repopulse_store::{
    ContributorRegistration, RegisteredRepository, RepositoryRegistration, SnapshotStore,
    SqliteStore, StoreError,
};

use crate::IngestError;
use crate::source::MetricsSource;

/// Adds a repository for a user.
///
/// Every upstream fetch happens before anything is written; the subject,
/// membership, and first snapshots are then stored in one transaction.
pub async fn register_repository(
    store: &SqliteStore,
    source: &dyn MetricsSource,
    user_id: UserId,
    repo_url: &str,
    now: DateTime<Utc>,
) -> Result<RegisteredRepository, IngestError> {
    let repo = RepoRef::parse_url(repo_url)?;
    let user = store
        .get_user(user_id)?
        .ok_or(IngestError::UnknownUser(user_id))?;
    let controls = |owner: &str| user.owners.iter().any(|candidate| candidate == owner);

    if let Some(existing) = store.find_subject(SubjectKind::Repository, &repo.full_name())? {
        let owner = existing.owner.as_deref().unwrap_or(repo.owner.as_str());
        return Err(if controls(owner) {
            IngestError::AlreadyTracked(repo.full_name())
        } else {
            IngestError::TrackedByAnotherUser(repo.full_name())
        });
    }

    if !controls(&repo.owner) {
        return Err(IngestError::OwnershipDenied {
            user_id,
            owner: repo.owner,
        });
    }

    let metrics = source.repository_metrics(&repo).await?;
    let mut contributors = Vec::new();
    for login in source.list_contributors(&repo).await? {
        let metrics = source.contributor_metrics(&repo, &login).await?;
        contributors.push(ContributorRegistration { login, metrics });
    }

    let registration = RepositoryRegistration {
        repo,
        registered_at: now,
        metrics,
        contributors,
    };

    match store.register_repository(&registration) {
        Ok(registered) => Ok(registered),
        Err(StoreError::AlreadyExists(_)) => {
            Err(IngestError::AlreadyTracked(registration.repo.full_name()))
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use repopulse_core::Metrics;

    use super::*;
    use crate::source::StaticMetricsSource;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 8, 1, 9, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn source() -> StaticMetricsSource {
        let repo = RepoRef::new("octo", "hello");
        StaticMetricsSource::new()
            .with_repository(
                &repo,
                Metrics {
                    commits: 30,
                    open_issues: 4,
                    ..Metrics::default()
                },
            )
            .with_contributor(
                &repo,
                "alice",
                Metrics {
                    commits: 20,
                    ..Metrics::default()
                },
            )
            .with_contributor(
                &repo,
                "bob",
                Metrics {
                    commits: 10,
                    ..Metrics::default()
                },
            )
    }

    #[tokio::test]
    async fn registers_repository_with_contributors() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let user = store
            .create_user("dana", &["octo".to_owned()], now())
            .expect("user");

        let registered = register_repository(
            &store,
            &source(),
            user.id,
            "https://github.com/octo/hello",
            now(),
        )
        .await
        .expect("register");

        assert_eq!(registered.repository.login, "octo/hello");
        assert_eq!(
            registered
                .contributors
                .iter()
                .map(|subject| subject.login.as_str())
                .collect::<Vec<_>>(),
            vec!["alice", "bob"]
        );
        let snapshot = store
            .latest_snapshot(registered.repository.id, None, None)
            .expect("latest")
            .expect("snapshot");
        assert_eq!(snapshot.metrics.open_issues, 4);
        assert_eq!(snapshot.taken_at, now());
    }

    #[tokio::test]
    async fn duplicate_registration_depends_on_who_asks() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let owner = store
            .create_user("dana", &["octo".to_owned()], now())
            .expect("user");
        let other = store
            .create_user("erin", &["elsewhere".to_owned()], now())
            .expect("user");
        let url = "https://github.com/octo/hello";

        register_repository(&store, &source(), owner.id, url, now())
            .await
            .expect("first registration");

        let again = register_repository(&store, &source(), owner.id, url, now())
            .await
            .expect_err("already added");
        assert!(matches!(again, IngestError::AlreadyTracked(_)));

        let foreign = register_repository(&store, &source(), other.id, url, now())
            .await
            .expect_err("tracked by someone else");
        assert!(matches!(foreign, IngestError::TrackedByAnotherUser(_)));
    }

    #[tokio::test]
    async fn rejects_bad_input_before_fetching() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let user = store
            .create_user("erin", &["elsewhere".to_owned()], now())
            .expect("user");

        let denied = register_repository(
            &store,
            &source(),
            user.id,
            "https://github.com/octo/hello",
            now(),
        )
        .await
        .expect_err("not an owner");
        assert!(matches!(
            denied,
            IngestError::OwnershipDenied { ref owner, .. } if owner == "octo"
        ));

        let invalid =
            register_repository(&store, &source(), user.id, "https://example.com/x", now())
                .await
                .expect_err("invalid url");
        assert!(matches!(invalid, IngestError::InvalidRepositoryUrl(_)));

        let unknown =
            register_repository(&store, &source(), 404, "https://github.com/octo/hello", now())
                .await
                .expect_err("unknown user");
        assert!(matches!(unknown, IngestError::UnknownUser(404)));
    }

    #[tokio::test]
    async fn upstream_failure_writes_nothing() {
        let store = SqliteStore::open_in_memory().expect("open store");
        let user = store
            .create_user("dana", &["octo".to_owned()], now())
            .expect("user");
        let failing = source().with_failing_repository(&RepoRef::new("octo", "hello"));

        let err = register_repository(
            &store,
            &failing,
            user.id,
            "https://github.com/octo/hello",
            now(),
        )
        .await
        .expect_err("upstream failure");
        assert!(err.is_retryable());
        assert!(store.repositories().expect("repositories").is_empty());
    }
}
