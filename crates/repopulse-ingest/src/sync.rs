use chrono::{DateTime, Utc};
use repopulse_analysis::{ActivityDeriver, DerivationReport};
use repopulse_core::RepoRef;
use repopulse_store::{SnapshotStore, SqliteStore, SubjectRecord};
use serde::Serialize;

use crate::IngestError;
use crate::source::MetricsSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct SyncReport {
    pub repositories_synced: usize,
    pub repositories_failed: usize,
    pub contributors_synced: usize,
    pub contributors_failed: usize,
    pub derivation: DerivationReport,
}

/// One pass over every tracked repository followed by event derivation.
///
/// Each snapshot is its own unit of work: a failed fetch or write is logged
/// and the cycle moves on to the next subject.
pub async fn run_sync_cycle(
    store: &SqliteStore,
    source: &dyn MetricsSource,
    now: DateTime<Utc>,
) -> Result<SyncReport, IngestError> {
    let mut report = SyncReport::default();

    for repository in store.repositories()? {
        let Some(repo) = repo_ref(&repository) else {
            tracing::warn!(
                repository_id = repository.id,
                login = %repository.login,
                "repository record has no owner/name, skipping"
            );
            report.repositories_failed += 1;
            continue;
        };

        match sync_repository(store, source, &repository, &repo, now).await {
            Ok(()) => report.repositories_synced += 1,
            Err(err) => {
                tracing::warn!(repository = %repo, error = %err, "repository sync failed");
                report.repositories_failed += 1;
            }
        }

        for login in contributors_to_sync(store, source, &repository, &repo).await? {
            match sync_contributor(store, source, &repository, &repo, &login, now).await {
                Ok(()) => report.contributors_synced += 1,
                Err(err) => {
                    tracing::warn!(
                        repository = %repo,
                        contributor = %login,
                        error = %err,
                        "contributor sync failed"
                    );
                    report.contributors_failed += 1;
                }
            }
        }
    }

    report.derivation = ActivityDeriver::new(store).derive_events(now)?;
    tracing::info!(
        repositories_synced = report.repositories_synced,
        repositories_failed = report.repositories_failed,
        contributors_synced = report.contributors_synced,
        contributors_failed = report.contributors_failed,
        events_written = report.derivation.events_written,
        "sync cycle finished"
    );

    Ok(report)
}

async fn sync_repository(
    store: &SqliteStore,
    source: &dyn MetricsSource,
    repository: &SubjectRecord,
    repo: &RepoRef,
    now: DateTime<Utc>,
) -> Result<(), IngestError> {
    let metrics = source.repository_metrics(repo).await?;
    store.record_repository_sync(repository.id, now, metrics)?;
    Ok(())
}

async fn sync_contributor(
    store: &SqliteStore,
    source: &dyn MetricsSource,
    repository: &SubjectRecord,
    repo: &RepoRef,
    login: &str,
    now: DateTime<Utc>,
) -> Result<(), IngestError> {
    let metrics = source.contributor_metrics(repo, login).await?;
    store.record_contributor_sync(repository.id, login, now, metrics)?;
    Ok(())
}

/// Known members first, in membership order, then newcomers reported upstream.
/// When the listing fails only known members are synced.
async fn contributors_to_sync(
    store: &SqliteStore,
    source: &dyn MetricsSource,
    repository: &SubjectRecord,
    repo: &RepoRef,
) -> Result<Vec<String>, IngestError> {
    let mut logins = store
        .scope_members(repository.id)?
        .into_iter()
        .map(|member| member.login)
        .collect::<Vec<_>>();

    match source.list_contributors(repo).await {
        Ok(listed) => {
            for login in listed {
                if !logins.contains(&login) {
                    logins.push(login);
                }
            }
        }
        Err(err) => {
            tracing::warn!(repository = %repo, error = %err, "listing contributors failed");
        }
    }

    Ok(logins)
}

fn repo_ref(repository: &SubjectRecord) -> Option<RepoRef> {
    match (&repository.owner, &repository.name) {
        (Some(owner), Some(name)) => Some(RepoRef::new(owner.as_str(), name.as_str())),
        _ => None,
    }
}
