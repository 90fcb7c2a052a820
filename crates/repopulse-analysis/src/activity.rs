use std::cmp::Reverse;

use chrono::{DateTime, Days, NaiveTime, Utc};
use repopulse_core::{EventType, SubjectId};
use repopulse_store::{ActivityEventRecord, NewActivityEvent, SnapshotStore};
use serde::Serialize;

use crate::AnalysisError;

pub const FEED_LIMIT: usize = 10;
const HIGHLIGHTED_ENTRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DerivationReport {
    pub pairs_examined: usize,
    pub pairs_skipped: usize,
    pub events_written: usize,
}

/// Turns growth between the two newest snapshots of each contributor and
/// repository pair into activity events.
pub struct ActivityDeriver<'a> {
    store: &'a dyn SnapshotStore,
}

impl<'a> ActivityDeriver<'a> {
    pub fn new(store: &'a dyn SnapshotStore) -> Self {
        Self { store }
    }

    pub fn derive_events(&self, now: DateTime<Utc>) -> Result<DerivationReport, AnalysisError> {
        let mut report = DerivationReport::default();
        let mut events = Vec::new();

        for pair in self.store.snapshot_pairs()? {
            report.pairs_examined += 1;

            let recent = self
                .store
                .recent_snapshots(pair.subject_id, Some(pair.scope_id), 2)?;
            let [latest, previous] = recent.as_slice() else {
                report.pairs_skipped += 1;
                continue;
            };

            for event_type in EventType::ALL {
                let metric = event_type.metric();
                let quantity = latest.metrics.get(metric) - previous.metrics.get(metric);
                if quantity > 0 {
                    events.push(NewActivityEvent {
                        subject_id: pair.subject_id,
                        scope_id: pair.scope_id,
                        event_type,
                        quantity,
                        occurred_at: now,
                        source_snapshot_id: latest.id,
                    });
                }
            }
        }

        report.events_written = self.store.append_events(&events)?;
        tracing::info!(
            pairs_examined = report.pairs_examined,
            pairs_skipped = report.pairs_skipped,
            events_written = report.events_written,
            "derived activity events"
        );

        Ok(report)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedEntry {
    pub id: i64,
    pub github_username: String,
    pub event_type: EventType,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
    pub highlighted: bool,
}

pub struct ActivityFeed<'a> {
    store: &'a dyn SnapshotStore,
}

impl<'a> ActivityFeed<'a> {
    pub fn new(store: &'a dyn SnapshotStore) -> Self {
        Self { store }
    }

    /// Today's largest events for a repository, the first few highlighted.
    pub fn recent_events(
        &self,
        scope_id: SubjectId,
        now: DateTime<Utc>,
    ) -> Result<Vec<FeedEntry>, AnalysisError> {
        let today = now.date_naive();
        let from = today.and_time(NaiveTime::MIN).and_utc();
        let to = today
            .checked_add_days(Days::new(1))
            .map(|tomorrow| tomorrow.and_time(NaiveTime::MIN).and_utc())
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let events = self.store.events_between(scope_id, from, to)?;
        Ok(rank_feed(events))
    }
}

fn rank_feed(mut events: Vec<ActivityEventRecord>) -> Vec<FeedEntry> {
    events.sort_by_key(|event| {
        (
            Reverse(event.quantity),
            Reverse(event.occurred_at),
            Reverse(event.id),
        )
    });

    events
        .into_iter()
        .take(FEED_LIMIT)
        .enumerate()
        .map(|(position, event)| FeedEntry {
            id: event.id,
            github_username: event.login,
            event_type: event.event_type,
            quantity: event.quantity,
            occurred_at: event.occurred_at,
            highlighted: position < HIGHLIGHTED_ENTRIES,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn event(id: i64, quantity: i64, hour: u32) -> ActivityEventRecord {
        ActivityEventRecord {
            id,
            subject_id: 1,
            scope_id: 2,
            login: format!("user{id}"),
            event_type: EventType::Commit,
            quantity,
            occurred_at: Utc
                .with_ymd_and_hms(2024, 7, 1, hour, 0, 0)
                .single()
                .expect("valid timestamp"),
            source_snapshot_id: id,
        }
    }

    #[test]
    fn feed_orders_by_quantity_then_recency_then_id() {
        let ranked = rank_feed(vec![event(1, 5, 9), event(2, 5, 11), event(3, 5, 11), event(4, 7, 1)]);

        assert_eq!(
            ranked.iter().map(|entry| entry.id).collect::<Vec<_>>(),
            vec![4, 3, 2, 1]
        );
        assert_eq!(
            ranked
                .iter()
                .map(|entry| entry.highlighted)
                .collect::<Vec<_>>(),
            vec![true, true, true, false]
        );
    }

    #[test]
    fn feed_is_truncated() {
        let ranked = rank_feed((1..=14).map(|id| event(id, id, 8)).collect());
        assert_eq!(ranked.len(), FEED_LIMIT);
        assert_eq!(ranked[0].quantity, 14);
        assert_eq!(ranked[FEED_LIMIT - 1].quantity, 5);
    }
}
