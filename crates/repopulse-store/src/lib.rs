use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use repopulse_config::{ConfigError, database_path, load_workspace_config};
use repopulse_core::{EventType, Metrics, SubjectId, SubjectKind};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, ffi, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod registry;

pub use registry::{
    ContributorRegistration, RegisteredRepository, RepositoryRegistration, UserRecord,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub id: SubjectId,
    pub kind: SubjectKind,
    /// GitHub login for contributors, `owner/name` for repositories.
    pub login: String,
    pub owner: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: i64,
    pub subject_id: SubjectId,
    pub scope_id: Option<SubjectId>,
    pub taken_at: DateTime<Utc>,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSnapshot {
    pub subject_id: SubjectId,
    pub scope_id: Option<SubjectId>,
    pub taken_at: DateTime<Utc>,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEventRecord {
    pub id: i64,
    pub subject_id: SubjectId,
    pub scope_id: SubjectId,
    pub login: String,
    pub event_type: EventType,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
    pub source_snapshot_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewActivityEvent {
    pub subject_id: SubjectId,
    pub scope_id: SubjectId,
    pub event_type: EventType,
    pub quantity: i64,
    pub occurred_at: DateTime<Utc>,
    pub source_snapshot_id: i64,
}

/// A (subject, scope) pair that has at least one scoped snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotPair {
    pub subject_id: SubjectId,
    pub scope_id: SubjectId,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("snapshot already exists for subject {subject_id} (scope {scope_id:?}) at {taken_at}")]
    DuplicateSnapshot {
        subject_id: SubjectId,
        scope_id: Option<SubjectId>,
        taken_at: DateTime<Utc>,
    },
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("failed to lock store connection")]
    LockPoisoned,
}

/// Read/append access to snapshots, subjects, and the activity-event log.
pub trait SnapshotStore {
    fn append_snapshot(&self, snapshot: NewSnapshot) -> Result<SnapshotRecord, StoreError>;

    /// Most recent snapshot for the pair, optionally restricted to snapshots
    /// taken on or before the given day (the whole day is included).
    fn latest_snapshot(
        &self,
        subject_id: SubjectId,
        scope_id: Option<SubjectId>,
        on_or_before: Option<NaiveDate>,
    ) -> Result<Option<SnapshotRecord>, StoreError>;

    /// Every scope the subject has snapshots in, `None` for unscoped ones.
    fn snapshot_scopes(&self, subject_id: SubjectId) -> Result<Vec<Option<SubjectId>>, StoreError>;

    /// Up to `limit` snapshots for the pair, newest first.
    fn recent_snapshots(
        &self,
        subject_id: SubjectId,
        scope_id: Option<SubjectId>,
        limit: u32,
    ) -> Result<Vec<SnapshotRecord>, StoreError>;

    /// The scope repository's own snapshots taken on or after the start of
    /// `since`, oldest first.
    fn snapshots_since(
        &self,
        scope_id: SubjectId,
        since: NaiveDate,
    ) -> Result<Vec<SnapshotRecord>, StoreError>;

    fn snapshot_pairs(&self) -> Result<Vec<SnapshotPair>, StoreError>;

    fn get_subject(&self, subject_id: SubjectId) -> Result<Option<SubjectRecord>, StoreError>;

    fn find_subject(
        &self,
        kind: SubjectKind,
        login: &str,
    ) -> Result<Option<SubjectRecord>, StoreError>;

    /// Members of a scope in the order they joined it.
    fn scope_members(&self, scope_id: SubjectId) -> Result<Vec<SubjectRecord>, StoreError>;

    /// Appends events in one transaction. Events already derived from the same
    /// source snapshot and type are skipped; returns the number written.
    fn append_events(&self, events: &[NewActivityEvent]) -> Result<usize, StoreError>;

    /// Events for a scope with `from <= occurred_at < to`.
    fn events_between(
        &self,
        scope_id: SubjectId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ActivityEventRecord>, StoreError>;

    fn user_controls_repository(
        &self,
        user_id: i64,
        repository_id: SubjectId,
    ) -> Result<bool, StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    pub fn open(sqlite_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let sqlite_path = sqlite_path.as_ref();
        if let Some(parent) = sqlite_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(sqlite_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::from_connection(conn, Some(sqlite_path.to_path_buf()))
    }

    /// Opens the database configured for a workspace root.
    pub fn open_workspace(workspace_root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let workspace_root = workspace_root.as_ref();
        let config = load_workspace_config(workspace_root)?;
        Self::open(database_path(workspace_root, &config))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;
        tracing::debug!(path = ?path, "snapshot store ready");

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl SnapshotStore for SqliteStore {
    fn append_snapshot(&self, snapshot: NewSnapshot) -> Result<SnapshotRecord, StoreError> {
        let conn = self.lock()?;
        insert_snapshot(&conn, &snapshot)
    }

    fn latest_snapshot(
        &self,
        subject_id: SubjectId,
        scope_id: Option<SubjectId>,
        on_or_before: Option<NaiveDate>,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!(
                    r#"
                    SELECT {SNAPSHOT_COLUMNS}
                    FROM snapshots
                    WHERE subject_id = ?1
                      AND scope_id IS ?2
                      AND taken_at < ?3
                    ORDER BY taken_at DESC, id DESC
                    LIMIT 1
                    "#
                ),
                params![subject_id, scope_id, upper_bound_millis(on_or_before)],
                snapshot_from_row,
            )
            .optional()?;

        Ok(record)
    }

    fn snapshot_scopes(&self, subject_id: SubjectId) -> Result<Vec<Option<SubjectId>>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT DISTINCT scope_id
            FROM snapshots
            WHERE subject_id = ?1
            ORDER BY scope_id IS NOT NULL, scope_id
            "#,
        )?;
        let scopes = stmt
            .query_map(params![subject_id], |row| row.get::<_, Option<SubjectId>>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(scopes)
    }

    fn recent_snapshots(
        &self,
        subject_id: SubjectId,
        scope_id: Option<SubjectId>,
        limit: u32,
    ) -> Result<Vec<SnapshotRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {SNAPSHOT_COLUMNS}
            FROM snapshots
            WHERE subject_id = ?1
              AND scope_id IS ?2
            ORDER BY taken_at DESC, id DESC
            LIMIT ?3
            "#
        ))?;

        let rows = stmt.query_map(params![subject_id, scope_id, limit], snapshot_from_row)?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn snapshots_since(
        &self,
        scope_id: SubjectId,
        since: NaiveDate,
    ) -> Result<Vec<SnapshotRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {SNAPSHOT_COLUMNS}
            FROM snapshots
            WHERE subject_id = ?1
              AND scope_id IS NULL
              AND taken_at >= ?2
            ORDER BY taken_at ASC, id ASC
            "#
        ))?;

        let rows = stmt.query_map(params![scope_id, day_start_millis(since)], snapshot_from_row)?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn snapshot_pairs(&self) -> Result<Vec<SnapshotPair>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT subject_id, scope_id
            FROM snapshots
            WHERE scope_id IS NOT NULL
            GROUP BY subject_id, scope_id
            ORDER BY MIN(id) ASC
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(SnapshotPair {
                subject_id: row.get(0)?,
                scope_id: row.get(1)?,
            })
        })?;

        let pairs = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    fn get_subject(&self, subject_id: SubjectId) -> Result<Option<SubjectRecord>, StoreError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {SUBJECT_COLUMNS} FROM subjects WHERE id = ?1"),
                params![subject_id],
                subject_from_row,
            )
            .optional()?;

        Ok(record)
    }

    fn find_subject(
        &self,
        kind: SubjectKind,
        login: &str,
    ) -> Result<Option<SubjectRecord>, StoreError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                &format!("SELECT {SUBJECT_COLUMNS} FROM subjects WHERE kind = ?1 AND login = ?2"),
                params![kind.as_str(), login.trim()],
                subject_from_row,
            )
            .optional()?;

        Ok(record)
    }

    fn scope_members(&self, scope_id: SubjectId) -> Result<Vec<SubjectRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT s.id, s.kind, s.login, s.owner, s.name, s.url, s.created_at, s.last_synced_at
            FROM scope_members m
            JOIN subjects s ON s.id = m.subject_id
            WHERE m.scope_id = ?1
            ORDER BY m.rowid ASC
            "#,
        )?;

        let rows = stmt.query_map(params![scope_id], subject_from_row)?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn append_events(&self, events: &[NewActivityEvent]) -> Result<usize, StoreError> {
        if events.is_empty() {
            return Ok(0);
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut written = 0usize;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO activity_events (
                    subject_id, scope_id, event_type, quantity, occurred_at, source_snapshot_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(source_snapshot_id, event_type) DO NOTHING
                "#,
            )?;

            for event in events {
                written += stmt.execute(params![
                    event.subject_id,
                    event.scope_id,
                    event.event_type.as_str(),
                    event.quantity,
                    event.occurred_at.timestamp_millis(),
                    event.source_snapshot_id,
                ])?;
            }
        }
        tx.commit()?;

        Ok(written)
    }

    fn events_between(
        &self,
        scope_id: SubjectId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<ActivityEventRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT e.id, e.subject_id, e.scope_id, s.login, e.event_type, e.quantity,
                   e.occurred_at, e.source_snapshot_id
            FROM activity_events e
            JOIN subjects s ON s.id = e.subject_id
            WHERE e.scope_id = ?1
              AND e.occurred_at >= ?2
              AND e.occurred_at < ?3
            ORDER BY e.occurred_at ASC, e.id ASC
            "#,
        )?;

        let rows = stmt.query_map(
            params![scope_id, from.timestamp_millis(), to.timestamp_millis()],
            |row| {
                Ok(ActivityEventRecord {
                    id: row.get(0)?,
                    subject_id: row.get(1)?,
                    scope_id: row.get(2)?,
                    login: row.get(3)?,
                    event_type: parse_column(row, 4)?,
                    quantity: row.get(5)?,
                    occurred_at: timestamp_column(row, 6)?,
                    source_snapshot_id: row.get(7)?,
                })
            },
        )?;

        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn user_controls_repository(
        &self,
        user_id: i64,
        repository_id: SubjectId,
    ) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                r#"
                SELECT 1
                FROM subjects r
                JOIN user_ownerships o ON o.owner = r.owner
                WHERE r.id = ?1
                  AND r.kind = 'repository'
                  AND o.user_id = ?2
                "#,
                params![repository_id, user_id],
                |_| Ok(()),
            )
            .optional()?;

        Ok(found.is_some())
    }
}

const SUBJECT_COLUMNS: &str = "id, kind, login, owner, name, url, created_at, last_synced_at";
const SNAPSHOT_COLUMNS: &str = "id, subject_id, scope_id, taken_at, commits, prs_opened, open_prs, merged_prs, open_issues, reviews";

fn insert_snapshot(conn: &Connection, snapshot: &NewSnapshot) -> Result<SnapshotRecord, StoreError> {
    let metrics = snapshot.metrics;
    let inserted = conn.execute(
        r#"
        INSERT INTO snapshots (
            subject_id, scope_id, taken_at,
            commits, prs_opened, open_prs, merged_prs, open_issues, reviews
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            snapshot.subject_id,
            snapshot.scope_id,
            snapshot.taken_at.timestamp_millis(),
            metrics.commits,
            metrics.prs_opened,
            metrics.open_prs,
            metrics.merged_prs,
            metrics.open_issues,
            metrics.reviews,
        ],
    );

    match inserted {
        Ok(_) => {}
        Err(err) if is_unique_violation(&err) => {
            return Err(StoreError::DuplicateSnapshot {
                subject_id: snapshot.subject_id,
                scope_id: snapshot.scope_id,
                taken_at: snapshot.taken_at,
            });
        }
        Err(err) => return Err(err.into()),
    }

    Ok(SnapshotRecord {
        id: conn.last_insert_rowid(),
        subject_id: snapshot.subject_id,
        scope_id: snapshot.scope_id,
        taken_at: truncate_to_millis(snapshot.taken_at),
        metrics,
    })
}

fn subject_from_row(row: &Row<'_>) -> rusqlite::Result<SubjectRecord> {
    Ok(SubjectRecord {
        id: row.get(0)?,
        kind: parse_column(row, 1)?,
        login: row.get(2)?,
        owner: row.get(3)?,
        name: row.get(4)?,
        url: row.get(5)?,
        created_at: timestamp_column(row, 6)?,
        last_synced_at: row
            .get::<_, Option<i64>>(7)?
            .map(|millis| millis_to_datetime(7, millis))
            .transpose()?,
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<SnapshotRecord> {
    Ok(SnapshotRecord {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        scope_id: row.get(2)?,
        taken_at: timestamp_column(row, 3)?,
        metrics: Metrics {
            commits: row.get(4)?,
            prs_opened: row.get(5)?,
            open_prs: row.get(6)?,
            merged_prs: row.get(7)?,
            open_issues: row.get(8)?,
            reviews: row.get(9)?,
        },
    })
}

fn parse_column<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(index)?;
    raw.parse::<T>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err)))
}

fn timestamp_column(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    millis_to_datetime(index, row.get(index)?)
}

fn millis_to_datetime(index: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(index, millis))
}

fn truncate_to_millis(value: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(value.timestamp_millis()).unwrap_or(value)
}

/// Exclusive upper bound covering the whole of `on_or_before`.
fn upper_bound_millis(on_or_before: Option<NaiveDate>) -> i64 {
    on_or_before
        .and_then(|day| day.succ_opt())
        .map(day_start_millis)
        .unwrap_or(i64::MAX)
}

fn day_start_millis(day: NaiveDate) -> i64 {
    day.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || inner.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS subjects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kind TEXT NOT NULL,
            login TEXT NOT NULL,
            owner TEXT,
            name TEXT,
            url TEXT,
            created_at INTEGER NOT NULL,
            last_synced_at INTEGER,
            UNIQUE (kind, login)
        );

        CREATE TABLE IF NOT EXISTS scope_members (
            scope_id INTEGER NOT NULL REFERENCES subjects(id),
            subject_id INTEGER NOT NULL REFERENCES subjects(id),
            first_seen INTEGER NOT NULL,
            last_seen INTEGER NOT NULL,
            PRIMARY KEY (scope_id, subject_id)
        );

        CREATE TABLE IF NOT EXISTS snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_id INTEGER NOT NULL REFERENCES subjects(id),
            scope_id INTEGER REFERENCES subjects(id),
            taken_at INTEGER NOT NULL,
            commits INTEGER NOT NULL DEFAULT 0,
            prs_opened INTEGER NOT NULL DEFAULT 0,
            open_prs INTEGER NOT NULL DEFAULT 0,
            merged_prs INTEGER NOT NULL DEFAULT 0,
            open_issues INTEGER NOT NULL DEFAULT 0,
            reviews INTEGER NOT NULL DEFAULT 0
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_snapshots_instant
            ON snapshots (subject_id, IFNULL(scope_id, 0), taken_at);
        CREATE INDEX IF NOT EXISTS idx_snapshots_scope
            ON snapshots (scope_id, taken_at);

        CREATE TABLE IF NOT EXISTS activity_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_id INTEGER NOT NULL REFERENCES subjects(id),
            scope_id INTEGER NOT NULL REFERENCES subjects(id),
            event_type TEXT NOT NULL,
            quantity INTEGER NOT NULL CHECK (quantity > 0),
            occurred_at INTEGER NOT NULL,
            source_snapshot_id INTEGER NOT NULL REFERENCES snapshots(id),
            UNIQUE (source_snapshot_id, event_type)
        );

        CREATE INDEX IF NOT EXISTS idx_activity_events_scope
            ON activity_events (scope_id, occurred_at);

        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS user_ownerships (
            user_id INTEGER NOT NULL REFERENCES users(id),
            owner TEXT NOT NULL,
            PRIMARY KEY (user_id, owner)
        );
        "#,
    )?;

    Ok(())
}
