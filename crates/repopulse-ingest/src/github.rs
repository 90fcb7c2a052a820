use std::env;
use std::time::Duration;

use async_trait::async_trait;
use repopulse_config::GithubConfig;
use repopulse_core::{Metrics, RepoRef};
use reqwest::header::{ACCEPT, AUTHORIZATION, LINK, USER_AGENT};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::source::{MetricsSource, SourceError};

const GITHUB_ACCEPT: &str = "application/vnd.github+json";
const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const CLIENT_USER_AGENT: &str = concat!("repopulse/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
struct SearchCount {
    total_count: i64,
}

#[derive(Debug, Deserialize)]
struct Account {
    login: String,
}

#[derive(Debug, Deserialize)]
struct PullSummary {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct Review {
    user: Option<Account>,
}

/// GitHub REST API metrics source.
#[derive(Debug, Clone)]
pub struct GithubMetricsSource {
    client: reqwest::Client,
    api_url: String,
    api_version: String,
    token: Option<String>,
    per_page: u32,
    review_scan_limit: u32,
}

impl GithubMetricsSource {
    /// Builds a client from config, reading the token from `token_env` when set.
    pub fn from_config(config: &GithubConfig) -> Result<Self, SourceError> {
        let token = read_env_non_empty(&config.token_env);
        if token.is_none() {
            tracing::warn!(
                token_env = %config.token_env,
                "no GitHub token configured, requests are unauthenticated"
            );
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_owned(),
            api_version: config.api_version.clone(),
            token,
            per_page: config.effective_per_page(),
            review_scan_limit: config.review_scan_limit,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path.trim_start_matches('/'))
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .get(url)
            .header(ACCEPT, GITHUB_ACCEPT)
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .header(API_VERSION_HEADER, &self.api_version);

        match &self.token {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, SourceError> {
        let value = self
            .request(&self.endpoint(path))
            .query(query)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(value)
    }

    /// Collects every item of a list endpoint by following `rel="next"` links,
    /// stopping early once `limit` items are gathered.
    async fn get_paginated(
        &self,
        path: &str,
        query: &[(&str, String)],
        limit: Option<usize>,
    ) -> Result<Vec<Value>, SourceError> {
        let mut items = Vec::new();

        let first = self
            .request(&self.endpoint(path))
            .query(query)
            .query(&[("per_page", self.per_page.to_string())]);
        let mut response = first.send().await?.error_for_status()?;

        loop {
            let next = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(next_page_url);

            let page: Value = response.json().await?;
            let Value::Array(page) = page else {
                return Err(SourceError::InvalidResponse(format!(
                    "expected a JSON array from {path}"
                )));
            };
            items.extend(page);

            if let Some(limit) = limit {
                if items.len() >= limit {
                    items.truncate(limit);
                    break;
                }
            }

            let Some(next) = next else {
                break;
            };
            response = self.request(&next).send().await?.error_for_status()?;
        }

        tracing::debug!(path, items = items.len(), "fetched paginated resource");
        Ok(items)
    }

    async fn search_count(&self, query: String) -> Result<i64, SourceError> {
        let result: SearchCount = self
            .get_json("search/issues", &[("q", query), ("per_page", "1".to_owned())])
            .await?;
        Ok(result.total_count)
    }

    async fn count_items(&self, path: &str, query: &[(&str, String)]) -> Result<i64, SourceError> {
        let items = self.get_paginated(path, query, None).await?;
        Ok(items.len() as i64)
    }

    /// Reviews on the most recently updated pull requests, optionally only
    /// those written by `reviewer`.
    async fn count_reviews(
        &self,
        repo: &RepoRef,
        reviewer: Option<&str>,
    ) -> Result<i64, SourceError> {
        let pulls = self
            .get_paginated(
                &format!("repos/{}/{}/pulls", repo.owner, repo.name),
                &[
                    ("state", "all".to_owned()),
                    ("sort", "updated".to_owned()),
                    ("direction", "desc".to_owned()),
                ],
                Some(self.review_scan_limit as usize),
            )
            .await?;

        let mut total = 0i64;
        for pull in pulls {
            let Ok(pull) = serde_json::from_value::<PullSummary>(pull) else {
                continue;
            };

            let reviews: Vec<Review> = self
                .get_json(
                    &format!("repos/{}/{}/pulls/{}/reviews", repo.owner, repo.name, pull.number),
                    &[],
                )
                .await?;

            total += match reviewer {
                Some(login) => reviews
                    .iter()
                    .filter(|review| {
                        review
                            .user
                            .as_ref()
                            .is_some_and(|user| user.login == login)
                    })
                    .count() as i64,
                None => reviews.len() as i64,
            };
        }

        Ok(total)
    }
}

#[async_trait]
impl MetricsSource for GithubMetricsSource {
    async fn repository_metrics(&self, repo: &RepoRef) -> Result<Metrics, SourceError> {
        let full_name = repo.full_name();

        let commits = self
            .count_items(&format!("repos/{full_name}/commits"), &[])
            .await?;
        let open_prs = self
            .search_count(format!("repo:{full_name} type:pr state:open"))
            .await?;
        let merged_prs = self
            .search_count(format!("repo:{full_name} type:pr is:merged"))
            .await?;
        let open_issues = self
            .search_count(format!("repo:{full_name} type:issue state:open"))
            .await?;
        let reviews = self.count_reviews(repo, None).await?;

        Ok(Metrics {
            commits,
            prs_opened: 0,
            open_prs,
            merged_prs,
            open_issues,
            reviews,
        })
    }

    async fn list_contributors(&self, repo: &RepoRef) -> Result<Vec<String>, SourceError> {
        let contributors = self
            .get_paginated(
                &format!("repos/{}/{}/contributors", repo.owner, repo.name),
                &[],
                None,
            )
            .await?;

        // anonymous contributors carry no login
        Ok(contributors
            .into_iter()
            .filter_map(|entry| serde_json::from_value::<Account>(entry).ok())
            .map(|account| account.login)
            .collect())
    }

    async fn contributor_metrics(
        &self,
        repo: &RepoRef,
        login: &str,
    ) -> Result<Metrics, SourceError> {
        let full_name = repo.full_name();

        let commits = self
            .count_items(
                &format!("repos/{full_name}/commits"),
                &[("author", login.to_owned())],
            )
            .await?;
        let prs_opened = self
            .search_count(format!("repo:{full_name} type:pr author:{login}"))
            .await?;
        let reviews = self.count_reviews(repo, Some(login)).await?;

        Ok(Metrics {
            commits,
            prs_opened,
            reviews,
            ..Metrics::default()
        })
    }
}

/// Extracts the `rel="next"` target from a `Link` header.
pub fn next_page_url(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|param| matches!(param.trim(), "rel=\"next\"" | "rel=next"));
        if !is_next {
            return None;
        }

        let target = target.trim();
        target
            .strip_prefix('<')
            .and_then(|rest| rest.strip_suffix('>'))
            .map(str::to_owned)
    })
}

fn read_env_non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}
