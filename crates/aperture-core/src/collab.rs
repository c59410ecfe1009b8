//! External collaborators the core calls out to, with the reference
//! implementations the CLI wires in.
//!
//! None of these format human-facing content; they receive outcomes and
//! decide what to do with them.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{ApertureError, Result};
use crate::io::atomic_write;
use crate::outcome::ResultSet;
use crate::paths;
use crate::settings::{ConfigStore, Namespace, Settings};
use crate::types::{BackendKind, Identity, PermissionChange, ProjectRequest};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Resolves who the orchestrator acts as when there is no natural caller.
pub trait IdentityProvider: Send + Sync {
    fn automation_identity(&self) -> Result<Identity>;
}

#[derive(Debug, Clone)]
pub struct SettingsIdentity {
    settings: Settings,
}

impl SettingsIdentity {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

impl IdentityProvider for SettingsIdentity {
    fn automation_identity(&self) -> Result<Identity> {
        self.settings
            .automation_user()?
            .ok_or(ApertureError::NoAutomationIdentity)
    }
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

pub trait Notifier: Send + Sync {
    /// A permission change succeeded on every backend.
    fn permissions_changed(&self, change: &PermissionChange);

    fn creation_failed(&self, request: &ProjectRequest, results: &ResultSet);

    /// A removal left errors behind; `requested_by` asked for it.
    fn removal_failed(&self, project_key: &str, requested_by: &str, results: &ResultSet);

    /// Tell the former members that the project is gone.
    fn project_removed(&self, project_key: &str, members: &[String]);
}

/// Logs every notification. Operator-facing notices carry the configured
/// `notification-email` as their recipient.
#[derive(Debug, Clone)]
pub struct TracingNotifier {
    settings: Settings,
}

impl TracingNotifier {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    fn operator(&self) -> String {
        self.settings
            .notification_email()
            .ok()
            .flatten()
            .unwrap_or_else(|| "<unset>".to_string())
    }
}

impl Notifier for TracingNotifier {
    fn permissions_changed(&self, change: &PermissionChange) {
        tracing::info!(
            project = %change.project_key,
            role = %change.role,
            mode = ?change.mode,
            to = ?change.subjects.names(),
            "notify: permissions changed"
        );
    }

    fn creation_failed(&self, request: &ProjectRequest, results: &ResultSet) {
        tracing::warn!(
            project = %request.project_key,
            issue = %request.issue_key,
            to = %request.requested_by,
            errors = %results,
            "notify: project creation failed"
        );
    }

    fn removal_failed(&self, project_key: &str, requested_by: &str, results: &ResultSet) {
        tracing::warn!(
            project = %project_key,
            to = %self.operator(),
            by = %requested_by,
            errors = %results,
            "notify: project removal failed"
        );
    }

    fn project_removed(&self, project_key: &str, members: &[String]) {
        tracing::info!(project = %project_key, to = ?members, "notify: project removed");
    }
}

// ---------------------------------------------------------------------------
// Triage workflow
// ---------------------------------------------------------------------------

/// Where a failed creation should be routed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriageHint {
    pub failed_backend: Option<BackendKind>,
    pub assignee: Option<String>,
}

impl TriageHint {
    /// Derive the hint from the first failed backend and its configured lead.
    pub fn from_results(results: &ResultSet, settings: &Settings) -> Self {
        let failed_backend = results.first_failed_kind();
        let assignee = failed_backend.and_then(|kind| match settings.service_lead(kind) {
            Ok(lead) => lead.filter(|l| !l.trim().is_empty()),
            Err(e) => {
                tracing::warn!(backend = %kind, error = %e, "failed to read service lead");
                None
            }
        });
        Self {
            failed_backend,
            assignee,
        }
    }
}

/// Lifecycle of the originating request.
pub trait TriageWorkflow: Send + Sync {
    /// Provisioning for `issue_key` has started.
    fn begin(&self, issue_key: &str) -> Result<()>;

    /// Provisioning finished cleanly.
    fn finish(&self, issue_key: &str, project_key: &str) -> Result<()>;

    /// Route the request to manual triage with the aggregated errors.
    fn triage(
        &self,
        issue_key: &str,
        project_key: &str,
        results: &ResultSet,
        hint: &TriageHint,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct TracingWorkflow;

impl TriageWorkflow for TracingWorkflow {
    fn begin(&self, issue_key: &str) -> Result<()> {
        tracing::info!(issue = %issue_key, "workflow: provisioning started");
        Ok(())
    }

    fn finish(&self, issue_key: &str, project_key: &str) -> Result<()> {
        tracing::info!(issue = %issue_key, project = %project_key, "workflow: provisioning finished");
        Ok(())
    }

    fn triage(
        &self,
        issue_key: &str,
        project_key: &str,
        results: &ResultSet,
        hint: &TriageHint,
    ) -> Result<()> {
        tracing::warn!(
            issue = %issue_key,
            project = %project_key,
            backend = ?hint.failed_backend,
            assignee = ?hint.assignee,
            errors = %results,
            "workflow: routed to manual triage"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Request source
// ---------------------------------------------------------------------------

/// Materializes the project request behind an issue key.
pub trait RequestSource: Send + Sync {
    fn load(&self, issue_key: &str) -> Result<ProjectRequest>;
}

/// Reads `.aperture/requests/<ISSUE>.yaml`.
#[derive(Debug, Clone)]
pub struct YamlRequestSource {
    root: PathBuf,
}

impl YamlRequestSource {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn save(&self, request: &ProjectRequest) -> Result<PathBuf> {
        paths::validate_issue_key(&request.issue_key)?;
        let path = paths::request_path(&self.root, &request.issue_key);
        atomic_write(&path, serde_yaml::to_string(request)?.as_bytes())?;
        Ok(path)
    }
}

impl RequestSource for YamlRequestSource {
    fn load(&self, issue_key: &str) -> Result<ProjectRequest> {
        paths::validate_issue_key(issue_key)?;
        let path = paths::request_path(&self.root, issue_key);
        if !path.exists() {
            return Err(ApertureError::RequestNotFound(issue_key.to_string()));
        }
        let data = std::fs::read_to_string(&path)?;
        let request: ProjectRequest = serde_yaml::from_str(&data)?;
        if request.issue_key != issue_key {
            return Err(ApertureError::InvalidArgument(format!(
                "{} declares issue_key '{}'",
                path.display(),
                request.issue_key
            )));
        }
        Ok(request)
    }
}

// ---------------------------------------------------------------------------
// Project directory
// ---------------------------------------------------------------------------

/// The projects the system has provisioned, and who belongs to them.
pub trait ProjectDirectory: Send + Sync {
    fn projects(&self) -> Result<Vec<String>>;

    fn members(&self, project_key: &str) -> Result<Vec<String>>;

    fn record(&self, request: &ProjectRequest) -> Result<()>;

    fn forget(&self, project_key: &str) -> Result<()>;
}

const PROJECTS_KEY: &str = "projects";
const MEMBERS_KEY: &str = "members";

/// Keeps the directory in the configuration store as comma-separated lists.
///
/// Create and remove jobs for different projects run concurrently, and each
/// edits the shared `projects` list; edits are serialized so none is lost.
#[derive(Clone)]
pub struct StoreDirectory {
    store: Arc<dyn ConfigStore>,
    edits: Arc<Mutex<()>>,
}

impl StoreDirectory {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            edits: Arc::new(Mutex::new(())),
        }
    }

    fn edit(&self) -> MutexGuard<'_, ()> {
        match self.edits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn read_list(&self, ns: &Namespace, key: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .store
            .get(ns, key)?
            .map(|raw| split_list(&raw))
            .unwrap_or_default())
    }

    fn write_list(&self, ns: &Namespace, key: &str, items: &BTreeSet<String>) -> Result<()> {
        if items.is_empty() {
            self.store.remove(ns, key)?;
        } else {
            let joined: Vec<&str> = items.iter().map(String::as_str).collect();
            self.store.put(ns, key, &joined.join(","))?;
        }
        Ok(())
    }
}

fn split_list(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl ProjectDirectory for StoreDirectory {
    fn projects(&self) -> Result<Vec<String>> {
        Ok(self
            .read_list(&Namespace::Global, PROJECTS_KEY)?
            .into_iter()
            .collect())
    }

    fn members(&self, project_key: &str) -> Result<Vec<String>> {
        let ns = Namespace::Project(project_key.to_string());
        Ok(self.read_list(&ns, MEMBERS_KEY)?.into_iter().collect())
    }

    fn record(&self, request: &ProjectRequest) -> Result<()> {
        let _edit = self.edit();
        let mut projects = self.read_list(&Namespace::Global, PROJECTS_KEY)?;
        projects.insert(request.project_key.clone());
        self.write_list(&Namespace::Global, PROJECTS_KEY, &projects)?;

        let ns = Namespace::Project(request.project_key.clone());
        let mut members = self.read_list(&ns, MEMBERS_KEY)?;
        members.insert(request.requested_by.clone());
        members.extend(request.users.iter().cloned());
        self.write_list(&ns, MEMBERS_KEY, &members)
    }

    fn forget(&self, project_key: &str) -> Result<()> {
        let _edit = self.edit();
        let mut projects = self.read_list(&Namespace::Global, PROJECTS_KEY)?;
        projects.remove(project_key);
        self.write_list(&Namespace::Global, PROJECTS_KEY, &projects)?;
        self.store
            .remove(&Namespace::Project(project_key.to_string()), MEMBERS_KEY)?;
        Ok(())
    }
}
