//! Persistent job store on redb.
//!
//! # Table design
//!
//! A single `JOBS` table uses a 24-byte composite key:
//! ```text
//! [ fire_at_ms: u64 big-endian (8 bytes) | uuid: 16 bytes ]
//! ```
//!
//! Byte order equals fire-time order, so `..=due_upper_bound(now)` yields
//! every job due by `now`, oldest first. Values are JSON.
//!
//! Status changes that race (dispatch against cancellation) go through
//! [`JobDb::compare_and_set`], which reads and writes inside one write
//! transaction; redb serializes write transactions, so exactly one of the
//! racing transitions wins.
//!
//! The file is opened for each operation and closed again, so the daemon
//! and CLI invocations can share it. redb holds an exclusive lock while a
//! handle is open; a caller that finds it taken waits for the holder to
//! finish.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::error::{ApertureError, Result};

use super::operation::{JobStatus, OperationKind, ScheduledOperation};

/// Key: 24-byte composite (fire_at_ms big-endian ++ uuid bytes)
/// Value: JSON-encoded ScheduledOperation
const JOBS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("jobs");

fn db_err(e: impl std::fmt::Display) -> ApertureError {
    ApertureError::JobDb(e.to_string())
}

fn job_key(fire_at: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = fire_at.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

/// Upper bound that includes every job firing at or before `now`.
fn due_upper_bound(now: DateTime<Utc>) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = now.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].fill(0xff);
    key
}

fn decode(bytes: &[u8]) -> Result<ScheduledOperation> {
    serde_json::from_slice(bytes).map_err(db_err)
}

/// How long an operation waits for another process to release the file.
const LOCK_WAIT: Duration = Duration::from_secs(10);
const LOCK_RETRY: Duration = Duration::from_millis(20);

pub struct JobDb {
    path: PathBuf,
    gate: Mutex<()>,
}

impl JobDb {
    /// Open or create the database at `path`, creating the table up front.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Self {
            path: path.to_path_buf(),
            gate: Mutex::new(()),
        };
        db.with_db(|db| {
            let wt = db.begin_write().map_err(db_err)?;
            wt.open_table(JOBS).map_err(db_err)?;
            wt.commit().map_err(db_err)
        })?;
        Ok(db)
    }

    /// Run `f` against a freshly opened handle, closing it afterwards.
    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let _gate = self
            .gate
            .lock()
            .map_err(|_| db_err("job database gate poisoned"))?;
        let deadline = Instant::now() + LOCK_WAIT;
        let db = loop {
            match Database::create(&self.path) {
                Ok(db) => break db,
                Err(redb::DatabaseError::DatabaseAlreadyOpen) if Instant::now() < deadline => {
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(redb::DatabaseError::DatabaseAlreadyOpen) => {
                    return Err(ApertureError::JobDb(format!(
                        "{} is held by another process",
                        self.path.display()
                    )));
                }
                Err(e) => return Err(db_err(e)),
            }
        };
        f(&db)
    }

    pub fn insert(&self, op: &ScheduledOperation) -> Result<()> {
        let key = job_key(op.fire_at, op.id);
        let value = serde_json::to_vec(op).map_err(db_err)?;
        self.with_db(|db| {
            let wt = db.begin_write().map_err(db_err)?;
            {
                let mut table = wt.open_table(JOBS).map_err(db_err)?;
                table
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(db_err)?;
            }
            wt.commit().map_err(db_err)
        })
    }

    /// Insert `op` unless an active job of the same kind and subject exists.
    ///
    /// Returns the existing job when the insert was skipped. Check and insert
    /// share one write transaction.
    pub fn insert_unique(&self, op: &ScheduledOperation) -> Result<Option<ScheduledOperation>> {
        let key = job_key(op.fire_at, op.id);
        let value = serde_json::to_vec(op).map_err(db_err)?;
        self.with_db(|db| {
            let wt = db.begin_write().map_err(db_err)?;
            {
                let mut table = wt.open_table(JOBS).map_err(db_err)?;
                let mut existing = None;
                for entry in table.iter().map_err(db_err)? {
                    let (_, v) = entry.map_err(db_err)?;
                    let job = decode(v.value())?;
                    if job.kind == op.kind
                        && job.subject_key == op.subject_key
                        && job.status.is_active()
                    {
                        existing = Some(job);
                        break;
                    }
                }
                if existing.is_some() {
                    drop(table);
                    wt.abort().map_err(db_err)?;
                    return Ok(existing);
                }
                table
                    .insert(key.as_slice(), value.as_slice())
                    .map_err(db_err)?;
            }
            wt.commit().map_err(db_err)?;
            Ok(None)
        })
    }

    /// Move job `id` from `expected` to `next`.
    ///
    /// Returns the updated job, or `None` when the stored status was not
    /// `expected` (someone else got there first).
    pub fn compare_and_set(
        &self,
        id: Uuid,
        expected: &JobStatus,
        next: JobStatus,
    ) -> Result<Option<ScheduledOperation>> {
        self.update(id, |job| {
            if job.status != *expected {
                return false;
            }
            job.status = next;
            true
        })
    }

    /// Overwrite the status of job `id` unconditionally.
    pub fn set_status(&self, id: Uuid, status: JobStatus) -> Result<ScheduledOperation> {
        self.update(id, |job| {
            job.status = status;
            true
        })?
        .ok_or_else(|| ApertureError::JobNotFound(id.to_string()))
    }

    /// Change how often a `Pending` recurring job repeats.
    ///
    /// Returns `None` when the job is no longer pending.
    pub fn set_recurrence(&self, id: Uuid, every: Duration) -> Result<Option<ScheduledOperation>> {
        self.update(id, |job| {
            if job.status != JobStatus::Pending {
                return false;
            }
            job.recurrence = Some(every);
            true
        })
    }

    /// Apply `change` to job `id` inside one write transaction; the job is
    /// written back only when `change` returns true.
    fn update(
        &self,
        id: Uuid,
        change: impl FnOnce(&mut ScheduledOperation) -> bool,
    ) -> Result<Option<ScheduledOperation>> {
        self.with_db(|db| {
            let wt = db.begin_write().map_err(db_err)?;
            let updated = {
                let mut table = wt.open_table(JOBS).map_err(db_err)?;
                let mut found = None;
                for entry in table.iter().map_err(db_err)? {
                    let (_, v) = entry.map_err(db_err)?;
                    let job = decode(v.value())?;
                    if job.id == id {
                        found = Some(job);
                        break;
                    }
                }
                let Some(mut job) = found else {
                    return Err(ApertureError::JobNotFound(id.to_string()));
                };
                if change(&mut job) {
                    job.updated_at = Utc::now();
                    let key = job_key(job.fire_at, job.id);
                    let value = serde_json::to_vec(&job).map_err(db_err)?;
                    table
                        .insert(key.as_slice(), value.as_slice())
                        .map_err(db_err)?;
                    Some(job)
                } else {
                    None
                }
            };
            wt.commit().map_err(db_err)?;
            Ok(updated)
        })
    }

    pub fn get(&self, id: Uuid) -> Result<Option<ScheduledOperation>> {
        Ok(self.list_all()?.into_iter().find(|j| j.id == id))
    }

    /// Every `Pending` job due by `now`, in fire-time order.
    pub fn range_due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledOperation>> {
        let upper = due_upper_bound(now);
        self.with_db(|db| {
            let rt = db.begin_read().map_err(db_err)?;
            let table = rt.open_table(JOBS).map_err(db_err)?;

            let mut due = Vec::new();
            for entry in table.range(..=upper.as_slice()).map_err(db_err)? {
                let (_, v) = entry.map_err(db_err)?;
                let job = decode(v.value())?;
                if job.status == JobStatus::Pending {
                    due.push(job);
                }
            }
            Ok(due)
        })
    }

    /// The earliest-firing active (pending or running) job for a subject.
    pub fn find_active(
        &self,
        kind: OperationKind,
        subject_key: &str,
    ) -> Result<Option<ScheduledOperation>> {
        Ok(self
            .list_all()?
            .into_iter()
            .find(|j| j.kind == kind && j.subject_key == subject_key && j.status.is_active()))
    }

    /// Every job, in fire-time order.
    pub fn list_all(&self) -> Result<Vec<ScheduledOperation>> {
        self.with_db(|db| {
            let rt = db.begin_read().map_err(db_err)?;
            let table = rt.open_table(JOBS).map_err(db_err)?;

            let mut jobs = Vec::new();
            for entry in table.iter().map_err(db_err)? {
                let (_, v) = entry.map_err(db_err)?;
                jobs.push(decode(v.value())?);
            }
            Ok(jobs)
        })
    }

    /// Mark every `Running` job not touched for `max_age` as `Failed`.
    ///
    /// Such jobs were interrupted by a crash; they are not retried.
    pub fn startup_recovery(&self, max_age: Duration) -> Result<u32> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).map_err(db_err)?;
        let mut count = 0u32;
        for job in self.list_all()? {
            if job.status == JobStatus::Running && job.updated_at <= cutoff {
                let failed = JobStatus::Failed {
                    reason: "recovered from restart".into(),
                };
                if self
                    .compare_and_set(job.id, &JobStatus::Running, failed)?
                    .is_some()
                {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Delete terminal jobs last updated more than `older_than` ago.
    pub fn prune(&self, older_than: Duration) -> Result<u32> {
        let cutoff = Utc::now() - chrono::Duration::from_std(older_than).map_err(db_err)?;
        self.with_db(|db| {
            let wt = db.begin_write().map_err(db_err)?;
            let removed = {
                let mut table = wt.open_table(JOBS).map_err(db_err)?;
                let mut doomed = Vec::new();
                for entry in table.iter().map_err(db_err)? {
                    let (k, v) = entry.map_err(db_err)?;
                    let job = decode(v.value())?;
                    if job.status.is_terminal() && job.updated_at <= cutoff {
                        doomed.push(k.value().to_vec());
                    }
                }
                for key in &doomed {
                    table.remove(key.as_slice()).map_err(db_err)?;
                }
                doomed.len() as u32
            };
            wt.commit().map_err(db_err)?;
            Ok(removed)
        })
    }
}
