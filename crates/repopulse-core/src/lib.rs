use std::collections::BTreeMap;
use std::fmt;
use std::ops::Sub;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type SubjectId = i64;
pub type UserId = i64;

/// Metric values keyed by metric, restricted to the metrics a subject kind tracks.
pub type MetricMap = BTreeMap<Metric, i64>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid GitHub repository URL '{0}'")]
    InvalidRepositoryUrl(String),
    #[error("invalid subject kind '{0}', expected one of: repository, contributor")]
    InvalidSubjectKind(String),
    #[error("invalid event type '{0}', expected one of: commit, pr, review")]
    InvalidEventType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Repository,
    Contributor,
}

impl SubjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Repository => "repository",
            Self::Contributor => "contributor",
        }
    }

    pub fn metrics(self) -> &'static [Metric] {
        match self {
            Self::Repository => &[
                Metric::Commits,
                Metric::OpenPrs,
                Metric::MergedPrs,
                Metric::OpenIssues,
                Metric::Reviews,
            ],
            Self::Contributor => &[Metric::Commits, Metric::PrsOpened, Metric::Reviews],
        }
    }
}

impl std::str::FromStr for SubjectKind {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "repository" => Ok(Self::Repository),
            "contributor" => Ok(Self::Contributor),
            other => Err(CoreError::InvalidSubjectKind(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Commits,
    PrsOpened,
    OpenPrs,
    MergedPrs,
    OpenIssues,
    Reviews,
}

impl Metric {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commits => "commits",
            Self::PrsOpened => "prs_opened",
            Self::OpenPrs => "open_prs",
            Self::MergedPrs => "merged_prs",
            Self::OpenIssues => "open_issues",
            Self::Reviews => "reviews",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Absolute counters captured by one snapshot.
///
/// Counters are cumulative in steady state but nothing here assumes they only
/// grow; subtraction yields signed deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub commits: i64,
    #[serde(default)]
    pub prs_opened: i64,
    #[serde(default)]
    pub open_prs: i64,
    #[serde(default)]
    pub merged_prs: i64,
    #[serde(default)]
    pub open_issues: i64,
    #[serde(default)]
    pub reviews: i64,
}

impl Metrics {
    pub fn get(&self, metric: Metric) -> i64 {
        match metric {
            Metric::Commits => self.commits,
            Metric::PrsOpened => self.prs_opened,
            Metric::OpenPrs => self.open_prs,
            Metric::MergedPrs => self.merged_prs,
            Metric::OpenIssues => self.open_issues,
            Metric::Reviews => self.reviews,
        }
    }

    pub fn select(&self, metrics: &[Metric]) -> MetricMap {
        metrics
            .iter()
            .map(|metric| (*metric, self.get(*metric)))
            .collect()
    }

    pub fn for_kind(&self, kind: SubjectKind) -> MetricMap {
        self.select(kind.metrics())
    }
}

impl Sub for Metrics {
    type Output = Metrics;

    fn sub(self, earlier: Metrics) -> Metrics {
        Metrics {
            commits: self.commits - earlier.commits,
            prs_opened: self.prs_opened - earlier.prs_opened,
            open_prs: self.open_prs - earlier.open_prs,
            merged_prs: self.merged_prs - earlier.merged_prs,
            open_issues: self.open_issues - earlier.open_issues,
            reviews: self.reviews - earlier.reviews,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Commit,
    Pr,
    Review,
}

impl EventType {
    pub const ALL: [EventType; 3] = [Self::Commit, Self::Pr, Self::Review];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Pr => "pr",
            Self::Review => "review",
        }
    }

    /// Contributor counter whose growth produces this event.
    pub fn metric(self) -> Metric {
        match self {
            Self::Commit => Metric::Commits,
            Self::Pr => Metric::PrsOpened,
            Self::Review => Metric::Reviews,
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "commit" => Ok(Self::Commit),
            "pr" => Ok(Self::Pr),
            "review" => Ok(Self::Review),
            other => Err(CoreError::InvalidEventType(other.to_owned())),
        }
    }
}

/// A GitHub repository identified by owner and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parses `https://github.com/<owner>/<name>` and the usual variants
    /// (no scheme, `www.`, trailing slash, `.git` suffix, extra path segments).
    pub fn parse_url(url: &str) -> Result<Self, CoreError> {
        let invalid = || CoreError::InvalidRepositoryUrl(url.to_owned());

        let trimmed = url.trim();
        let (_, rest) = trimmed.split_once("github.com/").ok_or_else(invalid)?;
        let rest = rest
            .split(['?', '#'])
            .next()
            .unwrap_or_default();

        let mut segments = rest.split('/').filter(|segment| !segment.is_empty());
        let owner = segments.next().ok_or_else(invalid)?;
        let name = segments.next().ok_or_else(invalid)?;
        let name = name.strip_suffix(".git").unwrap_or(name);

        if !is_valid_segment(owner) || !is_valid_segment(name) {
            return Err(invalid());
        }

        Ok(Self::new(owner, name))
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    pub fn url(&self) -> String {
        format!("https://github.com/{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
}
