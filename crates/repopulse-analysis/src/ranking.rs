use chrono::{NaiveDate, Utc};
use repopulse_core::{Metric, SubjectId};
use repopulse_store::SnapshotStore;
use serde::Serialize;

use crate::AnalysisError;
use crate::delta::{resolve_start, window_delta};

pub const RANKING_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContributorStanding {
    pub github_username: String,
    pub commits: i64,
    pub prs_opened: i64,
    pub reviews: i64,
}

impl ContributorStanding {
    fn value(&self, metric: Metric) -> i64 {
        match metric {
            Metric::PrsOpened => self.prs_opened,
            Metric::Reviews => self.reviews,
            _ => self.commits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct TopPerformers {
    pub top_committers: Vec<ContributorStanding>,
    pub top_prs: Vec<ContributorStanding>,
    pub top_reviewers: Vec<ContributorStanding>,
}

pub struct RankingEngine<'a> {
    store: &'a dyn SnapshotStore,
}

impl<'a> RankingEngine<'a> {
    pub fn new(store: &'a dyn SnapshotStore) -> Self {
        Self { store }
    }

    pub fn top_performers(
        &self,
        scope_id: SubjectId,
        window: Option<&str>,
    ) -> Result<TopPerformers, AnalysisError> {
        self.top_performers_at(scope_id, window, Utc::now().date_naive())
    }

    /// Leaderboards for the contributors of a repository. Members without
    /// enough history for the window are left out.
    pub fn top_performers_at(
        &self,
        scope_id: SubjectId,
        window: Option<&str>,
        today: NaiveDate,
    ) -> Result<TopPerformers, AnalysisError> {
        let start = resolve_start(window, today)?;

        let mut standings = Vec::new();
        for member in self.store.scope_members(scope_id)? {
            let Some(latest) = self.store.latest_snapshot(member.id, Some(scope_id), None)? else {
                continue;
            };

            let delta = match window_delta(self.store, &member, Some(scope_id), latest, start) {
                Ok(delta) => delta,
                Err(err) if err.is_pending() => {
                    tracing::debug!(
                        contributor = %member.login,
                        scope_id,
                        "skipping contributor without baseline snapshot"
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };

            let stats = delta.stats();
            let stat = |metric: Metric| stats.get(&metric).copied().unwrap_or_default();
            standings.push(ContributorStanding {
                github_username: member.login,
                commits: stat(Metric::Commits),
                prs_opened: stat(Metric::PrsOpened),
                reviews: stat(Metric::Reviews),
            });
        }

        Ok(TopPerformers {
            top_committers: top_by(&standings, Metric::Commits),
            top_prs: top_by(&standings, Metric::PrsOpened),
            top_reviewers: top_by(&standings, Metric::Reviews),
        })
    }
}

fn top_by(standings: &[ContributorStanding], metric: Metric) -> Vec<ContributorStanding> {
    let mut sorted = standings.to_vec();
    // sort_by is stable, ties keep membership order
    sorted.sort_by(|left, right| right.value(metric).cmp(&left.value(metric)));
    sorted.truncate(RANKING_LIMIT);
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standing(name: &str, commits: i64, prs_opened: i64, reviews: i64) -> ContributorStanding {
        ContributorStanding {
            github_username: name.to_owned(),
            commits,
            prs_opened,
            reviews,
        }
    }

    #[test]
    fn top_by_is_stable_and_descending() {
        let standings = vec![
            standing("a", 3, 1, 0),
            standing("b", 5, 1, 0),
            standing("c", 3, 2, 0),
        ];

        let names = |list: Vec<ContributorStanding>| {
            list.into_iter()
                .map(|entry| entry.github_username)
                .collect::<Vec<_>>()
        };

        assert_eq!(names(top_by(&standings, Metric::Commits)), vec!["b", "a", "c"]);
        assert_eq!(names(top_by(&standings, Metric::PrsOpened)), vec!["c", "a", "b"]);
        assert_eq!(names(top_by(&standings, Metric::Reviews)), vec!["a", "b", "c"]);
    }

    #[test]
    fn top_by_truncates_to_limit() {
        let standings = (0..15)
            .map(|index| standing(&format!("user{index}"), index, 0, 0))
            .collect::<Vec<_>>();

        let top = top_by(&standings, Metric::Commits);
        assert_eq!(top.len(), RANKING_LIMIT);
        assert_eq!(top[0].github_username, "user14");
        assert_eq!(top[9].github_username, "user5");
    }
}
