use chrono::{DateTime, Utc};
use repopulse_core::{Metrics, RepoRef, SubjectId, SubjectKind, UserId};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};

use crate::{
    NewSnapshot, SUBJECT_COLUMNS, SqliteStore, StoreError, SubjectRecord, insert_snapshot,
    is_unique_violation, subject_from_row, timestamp_column,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub username: String,
    pub created_at: DateTime<Utc>,
    /// GitHub owners (users or organizations) this user controls.
    pub owners: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContributorRegistration {
    pub login: String,
    pub metrics: Metrics,
}

/// Everything fetched for a repository before it is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRegistration {
    pub repo: RepoRef,
    pub registered_at: DateTime<Utc>,
    pub metrics: Metrics,
    pub contributors: Vec<ContributorRegistration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisteredRepository {
    pub repository: SubjectRecord,
    pub contributors: Vec<SubjectRecord>,
}

impl SqliteStore {
    pub fn create_user(
        &self,
        username: &str,
        owners: &[String],
        now: DateTime<Utc>,
    ) -> Result<UserRecord, StoreError> {
        let username = username.trim();
        let mut owners = owners
            .iter()
            .map(|owner| owner.trim().to_owned())
            .filter(|owner| !owner.is_empty())
            .collect::<Vec<_>>();
        owners.sort();
        owners.dedup();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT INTO users (username, created_at) VALUES (?1, ?2)",
            params![username, now.timestamp_millis()],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::AlreadyExists(format!("user '{username}'")));
            }
            Err(err) => return Err(err.into()),
        }

        let user_id = tx.last_insert_rowid();
        for owner in &owners {
            tx.execute(
                "INSERT OR IGNORE INTO user_ownerships (user_id, owner) VALUES (?1, ?2)",
                params![user_id, owner],
            )?;
        }

        let record = load_user(&tx, user_id)?;
        tx.commit()?;

        record.ok_or_else(|| StoreError::AlreadyExists(format!("user '{username}'")))
    }

    pub fn get_user(&self, user_id: UserId) -> Result<Option<UserRecord>, StoreError> {
        let conn = self.lock()?;
        load_user(&conn, user_id)
    }

    pub fn repositories(&self) -> Result<Vec<SubjectRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUBJECT_COLUMNS} FROM subjects WHERE kind = 'repository' ORDER BY id ASC"
        ))?;

        let rows = stmt.query_map([], subject_from_row)?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Repositories whose owner is one of the user's ownerships.
    pub fn repositories_for_user(&self, user_id: UserId) -> Result<Vec<SubjectRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT s.id, s.kind, s.login, s.owner, s.name, s.url, s.created_at, s.last_synced_at
            FROM subjects s
            JOIN user_ownerships o ON o.owner = s.owner
            WHERE s.kind = 'repository'
              AND o.user_id = ?1
            ORDER BY s.id ASC
            "#,
        )?;

        let rows = stmt.query_map(params![user_id], subject_from_row)?;
        let records = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Writes the repository subject, its first snapshot, and every
    /// contributor with membership and first scoped snapshot in one
    /// transaction. Nothing is written if any step fails.
    pub fn register_repository(
        &self,
        registration: &RepositoryRegistration,
    ) -> Result<RegisteredRepository, StoreError> {
        let repo = &registration.repo;
        let at = registration.registered_at;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            r#"
            INSERT INTO subjects (kind, login, owner, name, url, created_at, last_synced_at)
            VALUES ('repository', ?1, ?2, ?3, ?4, ?5, ?5)
            "#,
            params![
                repo.full_name(),
                repo.owner,
                repo.name,
                repo.url(),
                at.timestamp_millis(),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::AlreadyExists(format!("repository '{repo}'")));
            }
            Err(err) => return Err(err.into()),
        }
        let repository_id = tx.last_insert_rowid();

        insert_snapshot(
            &tx,
            &NewSnapshot {
                subject_id: repository_id,
                scope_id: None,
                taken_at: at,
                metrics: registration.metrics,
            },
        )?;

        let mut contributor_ids = Vec::with_capacity(registration.contributors.len());
        for contributor in &registration.contributors {
            let contributor_id = record_member_snapshot(
                &tx,
                repository_id,
                &contributor.login,
                contributor.metrics,
                at,
            )?;
            contributor_ids.push(contributor_id);
        }

        let repository = load_subject(&tx, repository_id)?;
        let contributors = contributor_ids
            .into_iter()
            .map(|id| load_subject(&tx, id))
            .collect::<Result<Vec<_>, _>>()?;
        tx.commit()?;

        tracing::info!(
            repository = %repo,
            contributors = contributors.len(),
            "registered repository"
        );

        Ok(RegisteredRepository {
            repository,
            contributors,
        })
    }

    /// Appends the repository's own snapshot and stamps `last_synced_at`.
    pub fn record_repository_sync(
        &self,
        repository_id: SubjectId,
        taken_at: DateTime<Utc>,
        metrics: Metrics,
    ) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        insert_snapshot(
            &tx,
            &NewSnapshot {
                subject_id: repository_id,
                scope_id: None,
                taken_at,
                metrics,
            },
        )?;
        tx.execute(
            "UPDATE subjects SET last_synced_at = ?2 WHERE id = ?1",
            params![repository_id, taken_at.timestamp_millis()],
        )?;
        tx.commit()?;

        Ok(())
    }

    /// Appends a contributor snapshot scoped to a repository, creating the
    /// contributor and its membership on first sight.
    pub fn record_contributor_sync(
        &self,
        repository_id: SubjectId,
        login: &str,
        taken_at: DateTime<Utc>,
        metrics: Metrics,
    ) -> Result<SubjectId, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let contributor_id = record_member_snapshot(&tx, repository_id, login, metrics, taken_at)?;
        tx.commit()?;

        Ok(contributor_id)
    }
}

fn record_member_snapshot(
    tx: &Transaction<'_>,
    repository_id: SubjectId,
    login: &str,
    metrics: Metrics,
    at: DateTime<Utc>,
) -> Result<SubjectId, StoreError> {
    let login = login.trim();
    let at_millis = at.timestamp_millis();

    let contributor_id: SubjectId = tx.query_row(
        r#"
        INSERT INTO subjects (kind, login, created_at)
        VALUES ('contributor', ?1, ?2)
        ON CONFLICT(kind, login) DO UPDATE SET login = excluded.login
        RETURNING id
        "#,
        params![login, at_millis],
        |row| row.get(0),
    )?;

    tx.execute(
        r#"
        INSERT INTO scope_members (scope_id, subject_id, first_seen, last_seen)
        VALUES (?1, ?2, ?3, ?3)
        ON CONFLICT(scope_id, subject_id) DO UPDATE SET last_seen = excluded.last_seen
        "#,
        params![repository_id, contributor_id, at_millis],
    )?;

    insert_snapshot(
        tx,
        &NewSnapshot {
            subject_id: contributor_id,
            scope_id: Some(repository_id),
            taken_at: at,
            metrics,
        },
    )?;

    Ok(contributor_id)
}

fn load_subject(conn: &Connection, subject_id: SubjectId) -> Result<SubjectRecord, StoreError> {
    let record = conn.query_row(
        &format!("SELECT {SUBJECT_COLUMNS} FROM subjects WHERE id = ?1"),
        params![subject_id],
        subject_from_row,
    )?;
    Ok(record)
}

fn load_user(conn: &Connection, user_id: UserId) -> Result<Option<UserRecord>, StoreError> {
    let user = conn
        .query_row(
            "SELECT id, username, created_at FROM users WHERE id = ?1",
            params![user_id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, timestamp_column(row, 2)?)),
        )
        .optional()?;

    let Some((id, username, created_at)) = user else {
        return Ok(None);
    };

    let mut stmt =
        conn.prepare("SELECT owner FROM user_ownerships WHERE user_id = ?1 ORDER BY owner ASC")?;
    let owners = stmt
        .query_map(params![id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(UserRecord {
        id,
        username,
        created_at,
        owners,
    }))
}
