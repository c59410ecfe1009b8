use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::outcome::IdleCheckResult;
use crate::scheduler::{ScheduledOperation, TaskOutcome, TaskRunner};

use super::{failed, Services};

/// Idle answers for one project.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectActivity {
    pub project_key: String,
    pub checks: Vec<IdleCheckResult>,
}

impl ProjectActivity {
    /// Every backend answered, and every answer was "idle".
    pub fn is_idle(&self) -> bool {
        !self.checks.is_empty() && self.checks.iter().all(|c| c.idle == Some(true))
    }
}

/// Runs idle detection for every known project. Detection only: nothing is
/// changed, idle projects are logged.
pub struct IdleScanRunner {
    services: Arc<Services>,
}

impl IdleScanRunner {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub async fn scan(&self) -> Result<Vec<ProjectActivity>> {
        let projects = self.services.directory.projects()?;
        let mut report = Vec::with_capacity(projects.len());
        for project_key in projects {
            match self.services.provisioner.detect_activity(&project_key).await {
                Ok(checks) => report.push(ProjectActivity { project_key, checks }),
                Err(e) => warn!(project = %project_key, error = %e, "idle check skipped"),
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl TaskRunner for IdleScanRunner {
    async fn run(&self, _op: &ScheduledOperation) -> TaskOutcome {
        let report = match self.scan().await {
            Ok(report) => report,
            Err(e) => return failed("idle scan could not list projects", e),
        };
        let mut idle = 0;
        for activity in &report {
            if activity.is_idle() {
                idle += 1;
                info!(project = %activity.project_key, "project is idle");
            }
        }
        TaskOutcome::Succeeded(format!("scanned {} project(s), {idle} idle", report.len()))
    }
}
