//! Job scheduler: enqueue, cancel, look up and dispatch background jobs.
//!
//! Dispatch is tick-driven. Each tick reads the due `Pending` jobs from the
//! store in fire order, claims each job's subject key, moves the job to
//! `Running` with a compare-and-set, and hands it to the runner registered
//! for its kind on a spawned task. A due job whose subject is already claimed
//! stays `Pending` and is picked up by a later tick, so two jobs for the same
//! subject never run at once.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ApertureError, Result};
use crate::paths::{validate_issue_key, validate_project_key};
use crate::settings::Settings;

use super::db::JobDb;
use super::operation::{
    CreateParams, JobStatus, OperationKind, RemoveParams, ScheduledOperation,
};

/// Subject key of the single recurring idle-scan job.
pub const IDLE_SCAN_SUBJECT: &str = "all-projects";

/// Terminal outcome a runner reports for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded(String),
    Failed(String),
}

/// The unit of work executed when a job of one kind fires.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, op: &ScheduledOperation) -> TaskOutcome;
}

type Claims = Arc<Mutex<HashSet<String>>>;

/// Held while a job runs; releases the subject on drop, panics included.
struct SubjectClaim {
    claims: Claims,
    subject: String,
}

impl SubjectClaim {
    fn acquire(claims: &Claims, subject: &str) -> Option<Self> {
        let mut held = claims.lock().unwrap_or_else(|p| p.into_inner());
        if !held.insert(subject.to_string()) {
            return None;
        }
        Some(Self {
            claims: Arc::clone(claims),
            subject: subject.to_string(),
        })
    }
}

impl Drop for SubjectClaim {
    fn drop(&mut self) {
        let mut held = self.claims.lock().unwrap_or_else(|p| p.into_inner());
        held.remove(&self.subject);
    }
}

pub struct Scheduler {
    db: Arc<JobDb>,
    settings: Settings,
    runners: HashMap<OperationKind, Arc<dyn TaskRunner>>,
    claims: Claims,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(db: Arc<JobDb>, settings: Settings) -> Self {
        Self {
            db,
            settings,
            runners: HashMap::new(),
            claims: Claims::default(),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn with_runner(mut self, kind: OperationKind, runner: Arc<dyn TaskRunner>) -> Self {
        self.runners.insert(kind, runner);
        self
    }

    pub fn db(&self) -> &Arc<JobDb> {
        &self.db
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Enqueue an immediate CREATE for `issue_key`.
    ///
    /// Enqueueing an issue that already has an active create job returns that
    /// job instead of adding a second one.
    pub fn schedule_create(&self, issue_key: &str) -> Result<ScheduledOperation> {
        validate_issue_key(issue_key)?;
        let params = CreateParams {
            issue_key: issue_key.to_string(),
        };
        let op = ScheduledOperation::with_params(OperationKind::Create, issue_key, Utc::now(), &params)?;
        match self.db.insert_unique(&op)? {
            Some(existing) => {
                info!(issue = %issue_key, job = %existing.id, "create already queued");
                Ok(existing)
            }
            None => {
                info!(issue = %issue_key, job = %op.id, "create scheduled");
                Ok(op)
            }
        }
    }

    /// Enqueue a REMOVE for `project_key` that fires after the undo window.
    pub fn schedule_removal(
        &self,
        project_key: &str,
        requested_by: &str,
    ) -> Result<ScheduledOperation> {
        validate_project_key(project_key)?;
        let now = Utc::now();
        let window = self.settings.delete_duration();
        let fire_at = chrono::Duration::from_std(window)
            .ok()
            .and_then(|step| now.checked_add_signed(step))
            .ok_or_else(|| {
                ApertureError::Scheduling(format!(
                    "undo window {} is out of range",
                    crate::duration::format(window)
                ))
            })?;
        let params = RemoveParams {
            project_key: project_key.to_string(),
            requested_by: requested_by.to_string(),
            requested_at: now,
        };
        let op = ScheduledOperation::with_params(OperationKind::Remove, project_key, fire_at, &params)?;
        if let Some(existing) = self.db.insert_unique(&op)? {
            return Err(ApertureError::RemovalAlreadyScheduled {
                project_key: project_key.to_string(),
                fire_at: existing.fire_at.to_rfc3339(),
            });
        }
        info!(
            project = %project_key,
            job = %op.id,
            fire_at = %op.fire_at.to_rfc3339(),
            by = %requested_by,
            "removal scheduled"
        );
        Ok(op)
    }

    /// Register the recurring idle scan unless one is already active.
    ///
    /// The first run fires immediately; each run re-arms one `idle-interval`
    /// after it finishes. A pending scan picks up a changed `idle-interval`.
    pub fn ensure_idle_scan(&self) -> Result<ScheduledOperation> {
        let every = self.settings.idle_interval();
        let op = ScheduledOperation::new(
            OperationKind::IdleScan,
            IDLE_SCAN_SUBJECT,
            Utc::now(),
            serde_json::Value::Null,
        )
        .recurring(every);
        match self.db.insert_unique(&op)? {
            Some(existing) if existing.recurrence == Some(every) => Ok(existing),
            Some(existing) => match self.db.set_recurrence(existing.id, every)? {
                Some(updated) => {
                    info!(job = %updated.id, every = %crate::duration::format(every), "idle scan interval changed");
                    Ok(updated)
                }
                None => Ok(existing),
            },
            None => {
                info!(job = %op.id, every = %crate::duration::format(every), "idle scan registered");
                Ok(op)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cancel and query
    // -----------------------------------------------------------------------

    /// Cancel the pending removal of `project_key`.
    ///
    /// Returns the cancelled job, or `None` (logged) when there was nothing
    /// pending to cancel. A removal that is already running is not stopped.
    pub fn cancel_removal(&self, project_key: &str) -> Result<Option<ScheduledOperation>> {
        let Some(job) = self.db.find_active(OperationKind::Remove, project_key)? else {
            warn!(project = %project_key, "no pending removal to cancel");
            return Ok(None);
        };
        match self
            .db
            .compare_and_set(job.id, &JobStatus::Pending, JobStatus::Cancelled)?
        {
            Some(cancelled) => {
                info!(project = %project_key, job = %job.id, "removal cancelled");
                Ok(Some(cancelled))
            }
            None => {
                warn!(project = %project_key, job = %job.id, "removal already running, not cancelled");
                Ok(None)
            }
        }
    }

    /// The active (pending or running) job of `kind` for `subject_key`.
    pub fn find_job(
        &self,
        kind: OperationKind,
        subject_key: &str,
    ) -> Result<Option<ScheduledOperation>> {
        self.db.find_active(kind, subject_key)
    }

    pub fn list_pending_removals(&self) -> Result<Vec<ScheduledOperation>> {
        Ok(self
            .db
            .list_all()?
            .into_iter()
            .filter(|j| j.kind == OperationKind::Remove && j.status == JobStatus::Pending)
            .collect())
    }

    /// Jobs in fire order; terminal ones only when `include_terminal`.
    pub fn list(&self, include_terminal: bool) -> Result<Vec<ScheduledOperation>> {
        Ok(self
            .db
            .list_all()?
            .into_iter()
            .filter(|j| include_terminal || j.status.is_active())
            .collect())
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Dispatch every job due by `now`. Returns how many were started.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut started = 0;
        for op in self.db.range_due(now)? {
            let Some(claim) = SubjectClaim::acquire(&self.claims, &op.subject_key) else {
                debug!(job = %op.id, subject = %op.subject_key, "subject busy, job stays queued");
                continue;
            };
            let Some(running) = self
                .db
                .compare_and_set(op.id, &JobStatus::Pending, JobStatus::Running)?
            else {
                debug!(job = %op.id, "job left pending state before dispatch");
                continue;
            };

            let db = Arc::clone(&self.db);
            let runner = self.runners.get(&running.kind).cloned();
            let handle = tokio::spawn(async move {
                execute(db, runner, running).await;
                drop(claim);
            });
            self.track(handle);
            started += 1;
        }
        Ok(started)
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        in_flight.retain(|h| !h.is_finished());
        in_flight.push(handle);
    }

    /// Wait for every dispatched job to finish.
    pub async fn drain(&self) {
        let handles: Vec<_> = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *in_flight)
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "job task aborted");
            }
        }
    }

    /// Tick every `tick-interval` until `shutdown` flips to true, then wait
    /// for in-flight jobs. Running jobs are never interrupted.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let period = self.settings.tick_interval();
        info!(every = %crate::duration::format(period), "scheduler started");
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(Utc::now()) {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopping, waiting for running jobs");
        self.drain().await;
        Ok(())
    }

    /// Recover jobs left `Running` by a crash; see [`JobDb::startup_recovery`].
    pub fn recover(&self, max_age: Duration) -> Result<u32> {
        let n = self.db.startup_recovery(max_age)?;
        if n > 0 {
            warn!(count = n, "marked interrupted jobs as failed");
        }
        Ok(n)
    }
}

/// Run one claimed job to a terminal state and re-arm it if recurring.
async fn execute(db: Arc<JobDb>, runner: Option<Arc<dyn TaskRunner>>, op: ScheduledOperation) {
    info!(job = %op.id, kind = %op.kind, subject = %op.subject_key, "job started");
    let outcome = match runner {
        Some(runner) => AssertUnwindSafe(runner.run(&op))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| TaskOutcome::Failed("task runner panicked".into())),
        None => TaskOutcome::Failed(format!("no runner registered for {} jobs", op.kind)),
    };

    let status = match outcome {
        TaskOutcome::Succeeded(message) => {
            info!(job = %op.id, kind = %op.kind, subject = %op.subject_key, %message, "job succeeded");
            JobStatus::Succeeded { message }
        }
        TaskOutcome::Failed(reason) => {
            error!(job = %op.id, kind = %op.kind, subject = %op.subject_key, %reason, "job failed");
            JobStatus::Failed { reason }
        }
    };
    if let Err(e) = db.set_status(op.id, status) {
        error!(job = %op.id, error = %e, "failed to record job outcome");
    }

    if let Some(next) = op.next_occurrence(Utc::now()) {
        match db.insert(&next) {
            Ok(()) => debug!(job = %next.id, fire_at = %next.fire_at.to_rfc3339(), "recurring job re-armed"),
            Err(e) => error!(job = %op.id, error = %e, "failed to re-arm recurring job"),
        }
    }
}
