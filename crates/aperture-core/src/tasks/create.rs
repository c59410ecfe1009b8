use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::collab::TriageHint;
use crate::outcome::ResultSet;
use crate::scheduler::{CreateParams, ScheduledOperation, TaskOutcome, TaskRunner};
use crate::settings::CompensationPolicy;
use crate::types::{PermissionChange, PermissionMode, ProjectRequest, Role};

use super::{failed, Services};

/// Provisions the project behind an issue, then attaches its members.
///
/// On any creation error the project is rolled back according to the
/// `compensation-policy` setting and the request is routed to triage.
pub struct CreateRunner {
    services: Arc<Services>,
}

impl CreateRunner {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn compensate(&self, request: &ProjectRequest) {
        let settings = self.services.provisioner.settings();
        match settings.compensation_policy() {
            CompensationPolicy::Teardown => {
                info!(project = %request.project_key, "rolling back partially created project");
                match self.services.provisioner.remove_project(&request.project_key).await {
                    Ok(results) if results.is_success() => {}
                    Ok(results) => {
                        warn!(project = %request.project_key, errors = %results, "rollback reported errors");
                    }
                    Err(e) => warn!(project = %request.project_key, error = %e, "rollback failed"),
                }
            }
            CompensationPolicy::FaultedOnly => {
                info!(project = %request.project_key, "leaving partial project in place for triage");
            }
        }
    }

    fn triage(&self, request: &ProjectRequest, results: &ResultSet) {
        let hint = TriageHint::from_results(results, self.services.provisioner.settings());
        if let Err(e) = self.services.workflow.triage(
            &request.issue_key,
            &request.project_key,
            results,
            &hint,
        ) {
            warn!(issue = %request.issue_key, error = %e, "failed to route request to triage");
        }
    }

    /// Add the request's users, then its groups, as developers.
    async fn attach_members(&self, request: &ProjectRequest) -> ResultSet {
        let mut results = ResultSet::new();
        let changes = [
            PermissionChange::users(
                &request.project_key,
                PermissionMode::Add,
                Role::Developer,
                request.users.clone(),
            ),
            PermissionChange::groups(
                &request.project_key,
                PermissionMode::Add,
                Role::Developer,
                request.groups.clone(),
            ),
        ];
        for change in changes.iter().filter(|c| !c.subjects.is_empty()) {
            match self.services.provisioner.modify_permissions(change).await {
                Ok(r) => results.extend(r),
                Err(e) => warn!(project = %request.project_key, error = %e, "membership update rejected"),
            }
        }
        results
    }
}

#[async_trait]
impl TaskRunner for CreateRunner {
    async fn run(&self, op: &ScheduledOperation) -> TaskOutcome {
        let params: CreateParams = match op.decode() {
            Ok(p) => p,
            Err(e) => return failed("invalid create job", e),
        };
        let request = match self.services.requests.load(&params.issue_key) {
            Ok(r) => r,
            Err(e) => return failed("cannot load project request", e),
        };
        if let Err(e) = self.services.workflow.begin(&request.issue_key) {
            return failed("cannot start provisioning workflow", e);
        }

        let results = match self.services.provisioner.create_project(&request).await {
            Ok(results) => results,
            Err(e) => {
                self.triage(&request, &ResultSet::new());
                return failed("project creation refused", e);
            }
        };

        if !results.is_success() {
            self.compensate(&request).await;
            self.triage(&request, &results);
            self.services.notifier.creation_failed(&request, &results);
            return TaskOutcome::Failed(format!(
                "creation of {} failed: {results}",
                request.project_key
            ));
        }

        if let Err(e) = self.services.directory.record(&request) {
            warn!(project = %request.project_key, error = %e, "failed to record project");
        }

        let membership = self.attach_members(&request).await;
        if !membership.is_success() {
            self.triage(&request, &membership);
            return TaskOutcome::Failed(format!(
                "project {} created but membership sync failed: {membership}",
                request.project_key
            ));
        }

        if let Err(e) = self
            .services
            .workflow
            .finish(&request.issue_key, &request.project_key)
        {
            warn!(issue = %request.issue_key, error = %e, "failed to close provisioning workflow");
        }
        TaskOutcome::Succeeded(format!(
            "project {} created on {} backend(s)",
            request.project_key,
            results.entries().len()
        ))
    }
}
