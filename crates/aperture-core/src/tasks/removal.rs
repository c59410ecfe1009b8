use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::scheduler::{RemoveParams, ScheduledOperation, TaskOutcome, TaskRunner};

use super::{failed, Services};

/// Tears a project down once its undo window has passed.
///
/// A clean teardown tells the project's members and drops the project from
/// the directory. A teardown with errors is reported to the operator and the
/// project stays in the directory so it can be removed again.
pub struct RemovalRunner {
    services: Arc<Services>,
}

impl RemovalRunner {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

#[async_trait]
impl TaskRunner for RemovalRunner {
    async fn run(&self, op: &ScheduledOperation) -> TaskOutcome {
        let params: RemoveParams = match op.decode() {
            Ok(p) => p,
            Err(e) => return failed("invalid removal job", e),
        };
        let key = &params.project_key;
        info!(
            project = %key,
            by = %params.requested_by,
            requested_at = %params.requested_at.to_rfc3339(),
            "removing project"
        );

        let members = self.services.directory.members(key).unwrap_or_else(|e| {
            warn!(project = %key, error = %e, "cannot read project members");
            Vec::new()
        });

        let results = match self.services.provisioner.remove_project(key).await {
            Ok(results) => results,
            Err(e) => return failed("project removal refused", e),
        };
        if !results.is_success() {
            self.services
                .notifier
                .removal_failed(key, &params.requested_by, &results);
            return TaskOutcome::Failed(format!("teardown of {key} reported errors: {results}"));
        }

        self.services.notifier.project_removed(key, &members);
        if let Err(e) = self.services.directory.forget(key) {
            warn!(project = %key, error = %e, "failed to drop project from directory");
        }
        TaskOutcome::Succeeded(format!(
            "project {key} removed from {} backend(s)",
            results.entries().len()
        ))
    }
}
