//! Backing stores for job records.
//!
//! Each job has a single writer (its driver task, plus an occasional revoke
//! from the API) and any number of pollers reading. Transitions are applied
//! atomically inside the store so a late write can never overwrite a terminal
//! state that landed first.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, warn};

use super::state::{JobId, JobRecord, JobState};
use crate::error::JobError;

/// Failure kind for jobs found unfinished when the store is reopened.
pub const INTERRUPTED_KIND: &str = "Interrupted";

/// Result of asking a store to move a job to a new state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The current state does not allow the move (e.g. it is terminal).
    Rejected,
    Missing,
}

pub trait JobStore: Send + Sync {
    fn insert(&self, record: &JobRecord) -> Result<()>;

    fn get(&self, id: &JobId) -> Result<Option<JobRecord>>;

    fn transition(
        &self,
        id: &JobId,
        next: JobState,
        progress_text: Option<String>,
    ) -> Result<Transition>;
}

fn apply_transition(
    record: &mut JobRecord,
    next: JobState,
    progress_text: Option<String>,
) -> Transition {
    match record.apply(next, progress_text) {
        Ok(()) => Transition::Applied,
        Err(err) => {
            debug!(job = %record.id, error = %err, "ignoring job transition");
            Transition::Rejected
        }
    }
}

/// Process-local store; pollers take the read lock, the writer the write
/// lock for the duration of a single record update. Records vanish with the
/// process, and finished ones stay until [`MemoryJobStore::evict_finished`].
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops terminal records not updated within `older_than`. Returns how
    /// many were removed.
    pub fn evict_finished(&self, older_than: TimeDelta) -> usize {
        let cutoff = Utc::now() - older_than;
        let mut jobs = self.jobs.write();
        let before = jobs.len();
        jobs.retain(|_, record| !(record.state.is_terminal() && record.updated_at <= cutoff));
        let evicted = before - jobs.len();
        if evicted > 0 {
            debug!(evicted, remaining = jobs.len(), "evicted finished jobs");
        }
        evicted
    }
}

impl JobStore for MemoryJobStore {
    fn insert(&self, record: &JobRecord) -> Result<()> {
        self.jobs.write().insert(record.id, record.clone());
        Ok(())
    }

    fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        Ok(self.jobs.read().get(id).cloned())
    }

    fn transition(
        &self,
        id: &JobId,
        next: JobState,
        progress_text: Option<String>,
    ) -> Result<Transition> {
        let mut jobs = self.jobs.write();
        Ok(match jobs.get_mut(id) {
            Some(record) => apply_transition(record, next, progress_text),
            None => Transition::Missing,
        })
    }
}

/// Durable store in SQLite. Every call opens its own short-lived connection
/// so the store is freely shareable across threads; WAL mode keeps pollers
/// from blocking the writer.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    db_path: PathBuf,
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl SqliteJobStore {
    /// Opens (and if necessary creates) the DB and ensures the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating job store directory {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("opening job store {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling WAL mode for job store")?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context("setting job store synchronous mode")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                state TEXT NOT NULL,
                state_json TEXT NOT NULL,
                progress_text TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
            "#,
        )
        .context("creating jobs table")?;

        let store = Self {
            db_path: path.to_path_buf(),
        };
        let interrupted = store.fail_interrupted()?;
        if interrupted > 0 {
            warn!(
                jobs = interrupted,
                path = %path.display(),
                "marked jobs left unfinished by a previous run as failed"
            );
        }
        Ok(store)
    }

    /// Fails every row a previous process left non-terminal; its driver is
    /// gone.
    fn fail_interrupted(&self) -> Result<usize> {
        self.with_connection(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let ids = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM jobs WHERE state NOT IN ('SUCCESS', 'FAILURE', 'REVOKED')",
                )?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                ids
            };

            let mut failed = 0;
            for raw in ids {
                let id: JobId = raw
                    .parse()
                    .with_context(|| format!("parsing stored job id {raw}"))?;
                let Some(mut record) = read_record(&tx, &id)? else {
                    continue;
                };
                let error = JobError::new(
                    INTERRUPTED_KIND,
                    format!(
                        "job was {} when the service stopped",
                        record.state.name()
                    ),
                );
                if apply_transition(&mut record, JobState::Failure { error }, None)
                    == Transition::Applied
                {
                    write_record(&tx, &record)?;
                    failed += 1;
                }
            }
            tx.commit()?;
            Ok(failed)
        })
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        // Opening never creates the schema; a vanished DB must surface as an
        // error instead of an empty store.
        if !self.db_path.exists() {
            anyhow::bail!("job store {} is missing", self.db_path.display());
        }
        let mut conn = Connection::open(&self.db_path)
            .with_context(|| format!("opening job store {}", self.db_path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        f(&mut conn)
    }
}

impl JobStore for SqliteJobStore {
    fn insert(&self, record: &JobRecord) -> Result<()> {
        self.with_connection(|conn| {
            write_record(conn, record)?;
            Ok(())
        })
    }

    fn get(&self, id: &JobId) -> Result<Option<JobRecord>> {
        self.with_connection(|conn| read_record(conn, id))
    }

    fn transition(
        &self,
        id: &JobId,
        next: JobState,
        progress_text: Option<String>,
    ) -> Result<Transition> {
        self.with_connection(|conn| {
            // IMMEDIATE takes the write lock up front so the read below sees
            // the state the update is applied against.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let Some(mut record) = read_record(&tx, id)? else {
                return Ok(Transition::Missing);
            };
            let outcome = apply_transition(&mut record, next, progress_text);
            if outcome == Transition::Applied {
                write_record(&tx, &record)?;
            }
            tx.commit()?;
            Ok(outcome)
        })
    }
}

fn write_record(conn: &Connection, record: &JobRecord) -> Result<()> {
    let state_json = serde_json::to_string(&record.state).context("serializing job state")?;
    conn.execute(
        r#"
        INSERT INTO jobs (id, state, state_json, progress_text, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(id) DO UPDATE SET
            state = excluded.state,
            state_json = excluded.state_json,
            progress_text = excluded.progress_text,
            updated_at = excluded.updated_at
        "#,
        params![
            record.id.to_string(),
            record.state.name(),
            state_json,
            record.progress_text,
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn read_record(conn: &Connection, id: &JobId) -> Result<Option<JobRecord>> {
    let mut stmt = conn.prepare(
        r#"
        SELECT id, state_json, progress_text, created_at, updated_at
        FROM jobs
        WHERE id = ?1
        "#,
    )?;
    let row = stmt
        .query_row([id.to_string()], RawRow::from_row)
        .optional()?;
    row.map(|raw| raw.into_record(*id)).transpose()
}

/// Column values as stored, converted outside the rusqlite row callback so
/// decoding errors carry context.
struct RawRow {
    state_json: String,
    progress_text: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            state_json: row.get("state_json")?,
            progress_text: row.get("progress_text")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn into_record(self, id: JobId) -> Result<JobRecord> {
        let state: JobState =
            serde_json::from_str(&self.state_json).context("parsing stored job state")?;
        Ok(JobRecord {
            id,
            state,
            progress_text: self.progress_text,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("parsing stored timestamp {value}"))?
        .with_timezone(&Utc))
}
