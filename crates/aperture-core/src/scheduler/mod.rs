//! Background job scheduling.
//!
//! Provides `ScheduledOperation`, its persistent store `JobDb`, and the
//! `Scheduler` that enqueues, cancels and dispatches jobs to `TaskRunner`s.

pub mod db;
pub mod operation;
pub mod service;

pub use db::JobDb;
pub use operation::{CreateParams, JobStatus, OperationKind, RemoveParams, ScheduledOperation};
pub use service::{Scheduler, TaskOutcome, TaskRunner, IDLE_SCAN_SUBJECT};
