use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use repopulse_core::{Metrics, RepoRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("response decoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("{0} not found upstream")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
}

/// Current absolute counters for repositories and their contributors.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn repository_metrics(&self, repo: &RepoRef) -> Result<Metrics, SourceError>;

    async fn list_contributors(&self, repo: &RepoRef) -> Result<Vec<String>, SourceError>;

    async fn contributor_metrics(
        &self,
        repo: &RepoRef,
        login: &str,
    ) -> Result<Metrics, SourceError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRepository {
    #[serde(default)]
    pub metrics: Metrics,
    /// Contributor counters keyed by login, listed in login order.
    #[serde(default)]
    pub contributors: BTreeMap<String, Metrics>,
}

/// Canned metrics for tests and offline runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticMetricsSource {
    #[serde(default)]
    repositories: BTreeMap<String, StaticRepository>,
    #[serde(skip)]
    failing: HashSet<String>,
}

impl StaticMetricsSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads `{"repositories": {"owner/name": {"metrics": {..}, "contributors": {..}}}}`.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn with_repository(mut self, repo: &RepoRef, metrics: Metrics) -> Self {
        self.repositories.entry(repo.full_name()).or_default().metrics = metrics;
        self
    }

    pub fn with_contributor(mut self, repo: &RepoRef, login: &str, metrics: Metrics) -> Self {
        self.repositories
            .entry(repo.full_name())
            .or_default()
            .contributors
            .insert(login.to_owned(), metrics);
        self
    }

    /// Makes every request touching `repo` fail.
    pub fn with_failing_repository(mut self, repo: &RepoRef) -> Self {
        self.failing.insert(repo.full_name());
        self
    }

    fn repository(&self, repo: &RepoRef) -> Result<&StaticRepository, SourceError> {
        let key = repo.full_name();
        if self.failing.contains(&key) {
            return Err(SourceError::Unavailable(format!("{key} is unavailable")));
        }
        self.repositories
            .get(&key)
            .ok_or_else(|| SourceError::NotFound(format!("repository '{key}'")))
    }
}

#[async_trait]
impl MetricsSource for StaticMetricsSource {
    async fn repository_metrics(&self, repo: &RepoRef) -> Result<Metrics, SourceError> {
        Ok(self.repository(repo)?.metrics)
    }

    async fn list_contributors(&self, repo: &RepoRef) -> Result<Vec<String>, SourceError> {
        Ok(self.repository(repo)?.contributors.keys().cloned().collect())
    }

    async fn contributor_metrics(
        &self,
        repo: &RepoRef,
        login: &str,
    ) -> Result<Metrics, SourceError> {
        self.repository(repo)?
            .contributors
            .get(login)
            .copied()
            .ok_or_else(|| SourceError::NotFound(format!("contributor '{login}' in {repo}")))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn static_source_serves_canned_metrics() {
        let repo = RepoRef::new("octo", "hello");
        let source = StaticMetricsSource::new()
            .with_repository(
                &repo,
                Metrics {
                    commits: 9,
                    ..Metrics::default()
                },
            )
            .with_contributor(&repo, "bob", Metrics::default())
            .with_contributor(&repo, "alice", Metrics::default());

        assert_eq!(
            source
                .repository_metrics(&repo)
                .await
                .expect("metrics")
                .commits,
            9
        );
        assert_eq!(
            source.list_contributors(&repo).await.expect("contributors"),
            vec!["alice", "bob"]
        );
        assert!(matches!(
            source.contributor_metrics(&repo, "carol").await,
            Err(SourceError::NotFound(_))
        ));
        assert!(matches!(
            source
                .repository_metrics(&RepoRef::new("octo", "other"))
                .await,
            Err(SourceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failing_repository_reports_unavailable() {
        let repo = RepoRef::new("octo", "hello");
        let source = StaticMetricsSource::new()
            .with_repository(&repo, Metrics::default())
            .with_failing_repository(&repo);

        assert!(matches!(
            source.list_contributors(&repo).await,
            Err(SourceError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn static_source_loads_fixture_file() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("fixture.json");
        fs::write(
            &path,
            r#"{
                "repositories": {
                    "octo/hello": {
                        "metrics": {"commits": 12, "open_prs": 1},
                        "contributors": {"alice": {"commits": 7, "reviews": 2}}
                    }
                }
            }"#,
        )
        .expect("write fixture");

        let source = StaticMetricsSource::from_json_file(&path).expect("load fixture");
        let repo = RepoRef::new("octo", "hello");
        let alice = source
            .contributor_metrics(&repo, "alice")
            .await
            .expect("alice metrics");
        assert_eq!(alice.commits, 7);
        assert_eq!(alice.reviews, 2);
        assert_eq!(alice.prs_opened, 0);
    }
}
