//! Task runners the scheduler executes when a job fires.
//!
//! Each runner decodes its typed parameters from the job payload, delegates
//! to the [`Provisioner`], and reports a terminal [`TaskOutcome`].

pub mod create;
pub mod idle;
pub mod removal;

use std::sync::Arc;

use crate::collab::{Notifier, ProjectDirectory, RequestSource, TriageWorkflow};
use crate::orchestrator::Provisioner;
use crate::scheduler::{OperationKind, Scheduler, TaskOutcome};

pub use create::CreateRunner;
pub use idle::{IdleScanRunner, ProjectActivity};
pub use removal::RemovalRunner;

/// Everything the runners call out to.
pub struct Services {
    pub provisioner: Arc<Provisioner>,
    pub requests: Arc<dyn RequestSource>,
    pub workflow: Arc<dyn TriageWorkflow>,
    pub notifier: Arc<dyn Notifier>,
    pub directory: Arc<dyn ProjectDirectory>,
}

/// Register one runner per operation kind.
pub fn install(scheduler: Scheduler, services: Arc<Services>) -> Scheduler {
    scheduler
        .with_runner(
            OperationKind::Create,
            Arc::new(CreateRunner::new(services.clone())),
        )
        .with_runner(
            OperationKind::Remove,
            Arc::new(RemovalRunner::new(services.clone())),
        )
        .with_runner(OperationKind::IdleScan, Arc::new(IdleScanRunner::new(services)))
}

/// Turn a failed setup step into a terminal failure.
fn failed(context: &str, e: impl std::fmt::Display) -> TaskOutcome {
    tracing::error!(error = %e, "{context}");
    TaskOutcome::Failed(format!("{context}: {e}"))
}
