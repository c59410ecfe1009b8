//! The capability contract every backend integration implements.
//!
//! Calls are blocking network operations. The orchestrator runs each one on
//! the blocking pool under a timeout, so implementations may block freely.
//!
//! # Obligations
//! - `create_service` reports success if the resource already exists.
//! - `destroy_service` reports success if the resource never existed or is
//!   already gone; it doubles as compensation after a partial failure.
//! - Expected failures (the backend rejected the input) are returned as an
//!   `OperationResult` with errors. `Err` is reserved for unexpected faults
//!   (transport, auth, unparseable responses) and is folded into a
//!   server-error entry by the orchestrator.

pub mod memory;
pub mod rest;

use crate::error::BackendResult;
use crate::outcome::OperationResult;
use crate::types::{BackendKind, CallContext, PermissionMode, ProjectRequest, Role};

pub use memory::MemoryBackend;
pub use rest::RestBackend;

pub trait Backend: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    /// Provision the backend-side resource for the project.
    fn create_service(
        &self,
        ctx: &CallContext,
        request: &ProjectRequest,
    ) -> BackendResult<OperationResult>;

    /// Remove the backend-side resource.
    fn destroy_service(&self, ctx: &CallContext, project_key: &str)
        -> BackendResult<OperationResult>;

    fn modify_users(
        &self,
        ctx: &CallContext,
        project_key: &str,
        mode: PermissionMode,
        role: Role,
        users: &[String],
    ) -> BackendResult<OperationResult>;

    fn modify_groups(
        &self,
        ctx: &CallContext,
        project_key: &str,
        mode: PermissionMode,
        role: Role,
        groups: &[String],
    ) -> BackendResult<OperationResult>;

    /// Does the backend-side resource for this project exist?
    fn is_service_available(&self, ctx: &CallContext, project_key: &str) -> BackendResult<bool>;

    /// Backend-specific inactivity heuristic.
    fn is_idle(&self, ctx: &CallContext, project_key: &str) -> BackendResult<bool>;
}
