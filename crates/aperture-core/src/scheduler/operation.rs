//! Scheduled operation data model.
//!
//! A `ScheduledOperation` is one queued background job: what to run (kind),
//! for whom (subject key), when (fire time), and an opaque JSON payload that
//! the matching task runner decodes into its typed parameters.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{ApertureError, Result};

// ---------------------------------------------------------------------------
// OperationKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Provision a project; subject is the originating issue key.
    Create,
    /// Tear a project down after the undo window; subject is the project key.
    Remove,
    /// Recurring idle detection across every known project.
    IdleScan,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Remove => "remove",
            OperationKind::IdleScan => "idle_scan",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = ApertureError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(OperationKind::Create),
            "remove" => Ok(OperationKind::Remove),
            "idle_scan" | "idle-scan" => Ok(OperationKind::IdleScan),
            other => Err(ApertureError::InvalidArgument(format!(
                "unknown operation kind: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
///
/// `Pending → Running → Succeeded | Failed`, and `Pending → Cancelled`.
/// Every state but `Pending` and `Running` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded { message: String },
    Failed { reason: String },
    Cancelled,
}

impl JobStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded { .. } => "succeeded",
            JobStatus::Failed { .. } => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// Typed parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateParams {
    pub issue_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveParams {
    pub project_key: String,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// ScheduledOperation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledOperation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub subject_key: String,
    pub fire_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// When set, a fresh `Pending` copy is scheduled `recurrence` after the
    /// job finishes, whatever its outcome.
    #[serde(
        serialize_with = "serialize_duration_opt",
        deserialize_with = "deserialize_duration_opt",
        default
    )]
    pub recurrence: Option<Duration>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledOperation {
    pub fn new(
        kind: OperationKind,
        subject_key: impl Into<String>,
        fire_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            subject_key: subject_key.into(),
            fire_at,
            payload,
            status: JobStatus::Pending,
            recurrence: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Build a job whose payload is the serialized `params`.
    pub fn with_params<P: Serialize>(
        kind: OperationKind,
        subject_key: impl Into<String>,
        fire_at: DateTime<Utc>,
        params: &P,
    ) -> Result<Self> {
        Ok(Self::new(
            kind,
            subject_key,
            fire_at,
            serde_json::to_value(params)?,
        ))
    }

    pub fn recurring(mut self, every: Duration) -> Self {
        self.recurrence = Some(every);
        self
    }

    /// Decode the payload into a runner's parameter type.
    pub fn decode<P: DeserializeOwned>(&self) -> Result<P> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ApertureError::InvalidArgument(format!(
                "job {} ({}) carries malformed parameters: {e}",
                self.id, self.kind
            ))
        })
    }

    /// The next `Pending` occurrence of a recurring job, fired `every` after
    /// `now`.
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> Option<Self> {
        let every = self.recurrence?;
        let step = chrono::Duration::from_std(every).ok()?;
        let fire_at = now.checked_add_signed(step)?;
        let mut next = Self::new(self.kind, self.subject_key.clone(), fire_at, self.payload.clone());
        next.recurrence = Some(every);
        Some(next)
    }
}

// ---------------------------------------------------------------------------
// Serde helpers for Duration (serialized as seconds: u64)
// ---------------------------------------------------------------------------

fn serialize_duration_opt<S>(d: &Option<Duration>, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match d {
        Some(dur) => s.serialize_some(&dur.as_secs()),
        None => s.serialize_none(),
    }
}

fn deserialize_duration_opt<'de, D>(d: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let secs: Option<u64> = Option::deserialize(d)?;
    Ok(secs.map(Duration::from_secs))
}
