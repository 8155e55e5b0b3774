//! SQLite implementation of every engine repository.
//!
//! Entities are stored as JSON bodies next to the columns used for filtering
//! and ordering. Optimistic concurrency is a plain
//! `UPDATE .. WHERE id = ? AND revision = ?`; all multi-row writes run in a
//! transaction on the single writer connection.

use chrono::{DateTime, SecondsFormat, Utc};
use orchestrion_core::repository::{
    DefinitionRepository, DeletedCounts, HistoryRepository, JobQuery, JobRepository,
    LeaseRepository, LockRequest, MigrationPlanRepository, ProcessQuery, RuntimeChanges,
    RuntimeRepository,
};
use orchestrion_types::activity::{ActivityExecution, TaskLock};
use orchestrion_types::definition::ProcessDefinition;
use orchestrion_types::error::RepositoryError;
use orchestrion_types::history::HistoryRecord;
use orchestrion_types::job::{Job, JobLease, JobState};
use orchestrion_types::migration::ProcessMigrationPlan;
use orchestrion_types::process::Process;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::pool::DatabasePool;

const TERMINAL_PROCESS_STATES: &str = "('completed', 'cancelled', 'terminated')";

/// SQLite-backed engine store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DatabasePool,
}

impl SqliteStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Internal row types and helpers
// ---------------------------------------------------------------------------

struct BodyRow {
    body: String,
}

impl BodyRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            body: row.try_get("body")?,
        })
    }

    fn decode<T: DeserializeOwned>(self) -> Result<T, RepositoryError> {
        serde_json::from_str(&self.body)
            .map_err(|e| RepositoryError::Query(format!("invalid stored JSON: {e}")))
    }
}

fn decode_rows<T: DeserializeOwned>(rows: &[SqliteRow]) -> Result<Vec<T>, RepositoryError> {
    rows.iter()
        .map(|row| BodyRow::from_row(row).map_err(query_error)?.decode())
        .collect()
}

fn decode_row<T: DeserializeOwned>(row: Option<SqliteRow>) -> Result<Option<T>, RepositoryError> {
    row.map(|row| BodyRow::from_row(&row).map_err(query_error)?.decode())
        .transpose()
}

fn encode<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("failed to encode JSON: {e}")))
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

/// Unique-key violations on insert mean the entity already exists.
fn insert_error(e: sqlx::Error, kind: &str, id: &str) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.is_unique_violation() {
            return RepositoryError::Conflict(format!("{kind} {id} already exists"));
        }
    }
    RepositoryError::Query(e.to_string())
}

/// Fixed precision keeps stored timestamps comparable as text.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn format_opt(dt: Option<&DateTime<Utc>>) -> Option<String> {
    dt.map(format_datetime)
}

/// `LIMIT -1` is unbounded in SQLite.
fn limit_of(limit: Option<u32>) -> i64 {
    limit.map_or(-1, i64::from)
}

/// Explain why a revision-checked update touched no row.
async fn revision_mismatch(
    conn: &mut SqliteConnection,
    table: &str,
    kind: &str,
    id: &str,
    expected: u64,
) -> RepositoryError {
    let sql = format!("SELECT revision FROM {table} WHERE id = ?");
    match sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await {
        Ok(None) => RepositoryError::NotFound,
        Ok(Some(row)) => {
            let current: i64 = row.try_get("revision").unwrap_or(-1);
            RepositoryError::Conflict(format!(
                "{kind} {id} is at revision {current}, expected {expected}"
            ))
        }
        Err(e) => query_error(e),
    }
}

// ---------------------------------------------------------------------------
// Row writers
// ---------------------------------------------------------------------------

async fn insert_process(conn: &mut SqliteConnection, process: &Process) -> Result<(), RepositoryError> {
    let mut stored = process.clone();
    stored.revision = 1;
    let id = process.id.to_string();
    sqlx::query(
        r#"INSERT INTO processes
           (id, definition_id, definition_key, state, parent_process_id, suspended,
            revision, created_at, completed_at, body)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(process.definition_id.to_string())
    .bind(&process.definition_key)
    .bind(process.state.as_str())
    .bind(process.parent.as_ref().map(|p| p.process_id.to_string()))
    .bind(process.suspended)
    .bind(stored.revision as i64)
    .bind(format_datetime(&process.created_at))
    .bind(format_opt(process.completed_at.as_ref()))
    .bind(encode(&stored)?)
    .execute(&mut *conn)
    .await
    .map_err(|e| insert_error(e, "process", &id))?;
    Ok(())
}

async fn update_process(conn: &mut SqliteConnection, process: &Process) -> Result<(), RepositoryError> {
    let mut stored = process.clone();
    stored.revision += 1;
    let id = process.id.to_string();
    let result = sqlx::query(
        r#"UPDATE processes
           SET definition_id = ?, definition_key = ?, state = ?, parent_process_id = ?,
               suspended = ?, revision = ?, completed_at = ?, body = ?
           WHERE id = ? AND revision = ?"#,
    )
    .bind(process.definition_id.to_string())
    .bind(&process.definition_key)
    .bind(process.state.as_str())
    .bind(process.parent.as_ref().map(|p| p.process_id.to_string()))
    .bind(process.suspended)
    .bind(stored.revision as i64)
    .bind(format_opt(process.completed_at.as_ref()))
    .bind(encode(&stored)?)
    .bind(&id)
    .bind(process.revision as i64)
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;

    if result.rows_affected() == 0 {
        return Err(revision_mismatch(conn, "processes", "process", &id, process.revision).await);
    }
    Ok(())
}

async fn insert_activity(conn: &mut SqliteConnection, activity: &ActivityExecution) -> Result<(), RepositoryError> {
    let mut stored = activity.clone();
    stored.revision = 1;
    let id = activity.id.to_string();
    sqlx::query(
        r#"INSERT INTO activities
           (id, process_id, state, activity_type, topic, lock_owner, lock_expires_at,
            available_at, timeout_at, revision, created_at, body)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(activity.process_id.to_string())
    .bind(activity.state.as_str())
    .bind(activity.activity_type.as_str())
    .bind(activity.topic.as_deref())
    .bind(activity.lock.as_ref().map(|l| l.worker_id.as_str()))
    .bind(format_opt(activity.lock.as_ref().map(|l| &l.expires_at)))
    .bind(format_opt(activity.available_at.as_ref()))
    .bind(format_opt(activity.timeout_at.as_ref()))
    .bind(stored.revision as i64)
    .bind(format_datetime(&activity.created_at))
    .bind(encode(&stored)?)
    .execute(&mut *conn)
    .await
    .map_err(|e| insert_error(e, "activity", &id))?;
    Ok(())
}

async fn update_activity(
    conn: &mut SqliteConnection,
    activity: &ActivityExecution,
) -> Result<ActivityExecution, RepositoryError> {
    let mut stored = activity.clone();
    stored.revision += 1;
    let id = activity.id.to_string();
    let result = sqlx::query(
        r#"UPDATE activities
           SET process_id = ?, state = ?, activity_type = ?, topic = ?, lock_owner = ?,
               lock_expires_at = ?, available_at = ?, timeout_at = ?, revision = ?, body = ?
           WHERE id = ? AND revision = ?"#,
    )
    .bind(activity.process_id.to_string())
    .bind(activity.state.as_str())
    .bind(activity.activity_type.as_str())
    .bind(activity.topic.as_deref())
    .bind(activity.lock.as_ref().map(|l| l.worker_id.as_str()))
    .bind(format_opt(activity.lock.as_ref().map(|l| &l.expires_at)))
    .bind(format_opt(activity.available_at.as_ref()))
    .bind(format_opt(activity.timeout_at.as_ref()))
    .bind(stored.revision as i64)
    .bind(encode(&stored)?)
    .bind(&id)
    .bind(activity.revision as i64)
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;

    if result.rows_affected() == 0 {
        return Err(revision_mismatch(conn, "activities", "activity", &id, activity.revision).await);
    }
    Ok(stored)
}

async fn insert_job_row(conn: &mut SqliteConnection, job: &Job) -> Result<(), RepositoryError> {
    let mut stored = job.clone();
    stored.revision = 1;
    let id = job.id.to_string();
    sqlx::query(
        r#"INSERT INTO jobs
           (id, job_type, state, process_id, run_at, lease_owner, lease_expires_at,
            finished_at, revision, created_at, body)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(&id)
    .bind(&job.job_type)
    .bind(job.state.as_str())
    .bind(job.process_id.map(|p| p.to_string()))
    .bind(format_datetime(&job.run_at))
    .bind(job.lease.as_ref().map(|l| l.owner.as_str()))
    .bind(format_opt(job.lease.as_ref().map(|l| &l.expires_at)))
    .bind(format_opt(job.completed_at.as_ref()))
    .bind(stored.revision as i64)
    .bind(format_datetime(&job.created_at))
    .bind(encode(&stored)?)
    .execute(&mut *conn)
    .await
    .map_err(|e| insert_error(e, "job", &id))?;
    Ok(())
}

/// Write `job` over its stored row. `bump` is false only for lease
/// extensions, which must not invalidate the holder's revision.
async fn update_job_row(conn: &mut SqliteConnection, job: &Job, bump: bool) -> Result<Job, RepositoryError> {
    let mut stored = job.clone();
    if bump {
        stored.revision += 1;
    }
    let id = job.id.to_string();
    let result = sqlx::query(
        r#"UPDATE jobs
           SET job_type = ?, state = ?, process_id = ?, run_at = ?, lease_owner = ?,
               lease_expires_at = ?, finished_at = ?, revision = ?, body = ?
           WHERE id = ? AND revision = ?"#,
    )
    .bind(&job.job_type)
    .bind(job.state.as_str())
    .bind(job.process_id.map(|p| p.to_string()))
    .bind(format_datetime(&job.run_at))
    .bind(job.lease.as_ref().map(|l| l.owner.as_str()))
    .bind(format_opt(job.lease.as_ref().map(|l| &l.expires_at)))
    .bind(format_opt(job.completed_at.as_ref()))
    .bind(stored.revision as i64)
    .bind(encode(&stored)?)
    .bind(&id)
    .bind(job.revision as i64)
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;

    if result.rows_affected() == 0 {
        return Err(revision_mismatch(conn, "jobs", "job", &id, job.revision).await);
    }
    Ok(stored)
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

impl DefinitionRepository for SqliteStore {
    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO definitions (id, key, version, deployed_at, body)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(definition.id.to_string())
        .bind(&definition.key)
        .bind(definition.version)
        .bind(format_datetime(&definition.deployed_at))
        .bind(encode(definition)?)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| insert_error(e, "definition", &definition.label()))?;
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<ProcessDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM definitions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        decode_row(row)
    }

    async fn find_definition(&self, key: &str, version: u32) -> Result<Option<ProcessDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM definitions WHERE key = ? AND version = ?")
            .bind(key)
            .bind(version)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        decode_row(row)
    }

    async fn latest_definition(&self, key: &str) -> Result<Option<ProcessDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM definitions WHERE key = ? ORDER BY version DESC LIMIT 1")
            .bind(key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        decode_row(row)
    }

    async fn list_definitions(&self) -> Result<Vec<ProcessDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT body FROM definitions ORDER BY key, version")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        decode_rows(&rows)
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

impl RuntimeRepository for SqliteStore {
    async fn commit(&self, changes: &RuntimeChanges) -> Result<(), RepositoryError> {
        if changes.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        if let Some(process) = &changes.process {
            if process.revision == 0 {
                insert_process(&mut tx, process).await?;
            } else {
                update_process(&mut tx, process).await?;
            }
        }
        for activity in &changes.activities {
            if activity.revision == 0 {
                insert_activity(&mut tx, activity).await?;
            } else {
                update_activity(&mut tx, activity).await?;
            }
        }
        for job in &changes.jobs {
            if job.revision == 0 {
                insert_job_row(&mut tx, job).await?;
            } else {
                update_job_row(&mut tx, job, true).await?;
            }
        }

        tx.commit().await.map_err(query_error)
    }

    async fn get_process(&self, id: &Uuid) -> Result<Option<Process>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM processes WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        decode_row(row)
    }

    async fn list_processes(&self, query: &ProcessQuery) -> Result<Vec<Process>, RepositoryError> {
        let state = query.state.map(|s| s.as_str());
        let definition_id = query.definition_id.map(|id| id.to_string());
        let parent = query.parent_process_id.map(|id| id.to_string());
        let rows = sqlx::query(
            r#"SELECT body FROM processes
               WHERE (?1 IS NULL OR state = ?1)
                 AND (?2 IS NULL OR definition_id = ?2)
                 AND (?3 IS NULL OR definition_key = ?3)
                 AND (?4 IS NULL OR parent_process_id = ?4)
               ORDER BY created_at, id
               LIMIT ?5 OFFSET ?6"#,
        )
        .bind(state)
        .bind(definition_id)
        .bind(query.definition_key.as_deref())
        .bind(parent)
        .bind(limit_of(query.limit))
        .bind(query.offset)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        decode_rows(&rows)
    }

    async fn get_activity(&self, id: &Uuid) -> Result<Option<ActivityExecution>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM activities WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        decode_row(row)
    }

    async fn list_activities(&self, process_id: &Uuid) -> Result<Vec<ActivityExecution>, RepositoryError> {
        let rows = sqlx::query("SELECT body FROM activities WHERE process_id = ? ORDER BY created_at, id")
            .bind(process_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        decode_rows(&rows)
    }

    async fn fetch_and_lock(&self, request: &LockRequest) -> Result<Vec<ActivityExecution>, RepositoryError> {
        let now = format_datetime(&request.now);
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let sql = format!(
            r#"SELECT a.body FROM activities a
               JOIN processes p ON p.id = a.process_id
               WHERE a.topic = ?1
                 AND a.activity_type = 'external_task'
                 AND a.state = 'active'
                 AND (a.lock_expires_at IS NULL OR a.lock_expires_at <= ?2)
                 AND (a.available_at IS NULL OR a.available_at <= ?2)
                 AND p.suspended = 0
                 AND p.state NOT IN {TERMINAL_PROCESS_STATES}
                 AND (?3 IS NULL OR p.definition_key = ?3)
               ORDER BY a.created_at, a.id
               LIMIT ?4"#
        );
        let rows = sqlx::query(&sql)
            .bind(&request.topic)
            .bind(&now)
            .bind(request.definition_key.as_deref())
            .bind(request.max_tasks as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(query_error)?;
        let candidates: Vec<ActivityExecution> = decode_rows(&rows)?;

        let mut locked = Vec::with_capacity(candidates.len());
        for mut activity in candidates.into_iter().filter(|a| a.is_fetchable(request.now)) {
            activity.lock = Some(TaskLock {
                worker_id: request.worker_id.clone(),
                expires_at: request.lock_until,
            });
            activity.updated_at = request.now;
            locked.push(update_activity(&mut tx, &activity).await?);
        }

        tx.commit().await.map_err(query_error)?;
        Ok(locked)
    }

    async fn find_timed_out(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<ActivityExecution>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT body FROM activities
               WHERE state = 'active'
                 AND timeout_at IS NOT NULL AND timeout_at <= ?
                 AND activity_type IN ('service_task', 'external_task', 'receive_task')
               ORDER BY timeout_at, id
               LIMIT ?"#,
        )
        .bind(format_datetime(&now))
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        decode_rows(&rows)
    }

    async fn find_compactable(
        &self,
        cutoff: DateTime<Utc>,
        after: Option<(DateTime<Utc>, Uuid)>,
        limit: u32,
    ) -> Result<Vec<Process>, RepositoryError> {
        let (after_created, after_id) = match after {
            Some((created_at, id)) => (Some(format_datetime(&created_at)), Some(id.to_string())),
            None => (None, None),
        };
        let sql = format!(
            r#"SELECT body FROM processes
               WHERE state IN {TERMINAL_PROCESS_STATES}
                 AND completed_at IS NOT NULL AND completed_at <= ?1
                 AND (?2 IS NULL OR created_at > ?2 OR (created_at = ?2 AND id > ?3))
               ORDER BY created_at, id
               LIMIT ?4"#
        );
        let rows = sqlx::query(&sql)
            .bind(format_datetime(&cutoff))
            .bind(after_created)
            .bind(after_id)
            .bind(limit)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;
        decode_rows(&rows)
    }

    async fn delete_process(&self, id: &Uuid) -> Result<DeletedCounts, RepositoryError> {
        let id = id.to_string();
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;

        let activities = sqlx::query("DELETE FROM activities WHERE process_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?
            .rows_affected();
        let jobs = sqlx::query("DELETE FROM jobs WHERE process_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?
            .rows_affected();
        let processes = sqlx::query("DELETE FROM processes WHERE id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?
            .rows_affected();

        tx.commit().await.map_err(query_error)?;
        Ok(DeletedCounts {
            processes,
            activities,
            jobs,
        })
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

impl JobRepository for SqliteStore {
    async fn insert_job(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut conn = self.pool.writer.acquire().await.map_err(query_error)?;
        insert_job_row(&mut conn, job).await
    }

    async fn get_job(&self, id: &Uuid) -> Result<Option<Job>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        decode_row(row)
    }

    async fn update_job(&self, job: &Job) -> Result<Job, RepositoryError> {
        let mut conn = self.pool.writer.acquire().await.map_err(query_error)?;
        if job.revision == 0 {
            return Err(revision_mismatch(&mut conn, "jobs", "job", &job.id.to_string(), 0).await);
        }
        update_job_row(&mut conn, job, true).await
    }

    async fn claim_job(
        &self,
        id: &Uuid,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        let row = sqlx::query("SELECT body FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_error)?;
        let Some(mut job) = decode_row::<Job>(row)? else {
            return Ok(None);
        };
        if !job.is_claimable(now) {
            return Ok(None);
        }

        job.state = JobState::Running;
        job.started_at.get_or_insert(now);
        job.lease = Some(JobLease {
            owner: owner.to_string(),
            expires_at: lease_until,
        });
        job.attempts += 1;
        job.updated_at = now;
        let claimed = update_job_row(&mut tx, &job, true).await?;

        tx.commit().await.map_err(query_error)?;
        Ok(Some(claimed))
    }

    async fn extend_job_lease(&self, id: &Uuid, owner: &str, until: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_error)?;
        let row = sqlx::query("SELECT body FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_error)?;
        let Some(mut job) = decode_row::<Job>(row)? else {
            return Ok(false);
        };
        if job.state != JobState::Running {
            return Ok(false);
        }
        match job.lease.as_mut() {
            Some(lease) if lease.owner == owner => lease.expires_at = until,
            _ => return Ok(false),
        }
        update_job_row(&mut tx, &job, false).await?;

        tx.commit().await.map_err(query_error)?;
        Ok(true)
    }

    async fn find_due_jobs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Job>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT j.body FROM jobs j
               LEFT JOIN processes p ON p.id = j.process_id
               WHERE ((j.state = 'created' AND j.run_at <= ?1)
                   OR (j.state = 'running' AND (j.lease_expires_at IS NULL OR j.lease_expires_at <= ?1)))
                 AND COALESCE(p.suspended, 0) = 0
               ORDER BY j.run_at, j.id
               LIMIT ?2"#,
        )
        .bind(format_datetime(&now))
        .bind(limit)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        let jobs: Vec<Job> = decode_rows(&rows)?;
        Ok(jobs.into_iter().filter(|j| j.is_claimable(now)).collect())
    }

    async fn delete_finished_jobs(&self, before: DateTime<Utc>, limit: u32) -> Result<u64, RepositoryError> {
        let deleted = sqlx::query(
            r#"DELETE FROM jobs WHERE id IN (
                   SELECT id FROM jobs
                   WHERE process_id IS NULL
                     AND state IN ('completed', 'failed')
                     AND finished_at < ?1
                   ORDER BY finished_at, id
                   LIMIT ?2)"#,
        )
        .bind(format_datetime(&before))
        .bind(limit)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?
        .rows_affected();
        Ok(deleted)
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<Job>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT body FROM jobs
               WHERE (?1 IS NULL OR state = ?1)
                 AND (?2 IS NULL OR job_type = ?2)
                 AND (?3 IS NULL OR process_id = ?3)
               ORDER BY created_at DESC, id DESC
               LIMIT ?4 OFFSET ?5"#,
        )
        .bind(query.state.map(|s| s.as_str()))
        .bind(query.job_type.as_deref())
        .bind(query.process_id.map(|id| id.to_string()))
        .bind(limit_of(query.limit))
        .bind(query.offset)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        decode_rows(&rows)
    }
}

// ---------------------------------------------------------------------------
// History, plans, leases
// ---------------------------------------------------------------------------

impl HistoryRepository for SqliteStore {
    async fn archive(&self, record: &HistoryRecord) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO history (process_id, archived_at, body) VALUES (?, ?, ?)
               ON CONFLICT (process_id) DO NOTHING"#,
        )
        .bind(record.process.id.to_string())
        .bind(format_datetime(&record.archived_at))
        .bind(encode(record)?)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_history(&self, process_id: &Uuid) -> Result<Option<HistoryRecord>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM history WHERE process_id = ?")
            .bind(process_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        decode_row(row)
    }

    async fn list_history(&self, limit: u32, offset: u32) -> Result<Vec<HistoryRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT body FROM history ORDER BY archived_at DESC, process_id DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        decode_rows(&rows)
    }

    async fn count_history(&self) -> Result<u64, RepositoryError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM history")
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_error)?;
        let total: i64 = row.try_get("total").map_err(query_error)?;
        Ok(total as u64)
    }
}

impl MigrationPlanRepository for SqliteStore {
    async fn save_plan(&self, plan: &ProcessMigrationPlan) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT OR REPLACE INTO migration_plans (id, definition_key, created_at, body)
               VALUES (?, ?, ?, ?)"#,
        )
        .bind(plan.id.to_string())
        .bind(&plan.definition_key)
        .bind(format_datetime(&plan.created_at))
        .bind(encode(plan)?)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(())
    }

    async fn get_plan(&self, id: &Uuid) -> Result<Option<ProcessMigrationPlan>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM migration_plans WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;
        decode_row(row)
    }

    async fn list_plans(&self, definition_key: Option<&str>) -> Result<Vec<ProcessMigrationPlan>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT body FROM migration_plans
               WHERE (?1 IS NULL OR definition_key = ?1)
               ORDER BY created_at DESC, id DESC"#,
        )
        .bind(definition_key)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;
        decode_rows(&rows)
    }
}

impl LeaseRepository for SqliteStore {
    async fn try_acquire_lease(
        &self,
        name: &str,
        owner: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO leases (name, owner, expires_at) VALUES (?1, ?2, ?3)
               ON CONFLICT (name) DO UPDATE
               SET owner = excluded.owner, expires_at = excluded.expires_at
               WHERE leases.owner = excluded.owner OR leases.expires_at <= ?4"#,
        )
        .bind(name)
        .bind(owner)
        .bind(format_datetime(&until))
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(&self, name: &str, owner: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM leases WHERE name = ? AND owner = ?")
            .bind(name)
            .bind(owner)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
