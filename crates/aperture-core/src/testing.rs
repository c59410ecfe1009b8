//! Shared fixtures for unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use crate::backend::memory::{CallLog, MemoryBackend};
use crate::backend::Backend;
use crate::collab::{Notifier, SettingsIdentity, StoreDirectory, TriageHint, TriageWorkflow, YamlRequestSource};
use crate::orchestrator::Provisioner;
use crate::outcome::ResultSet;
use crate::registry::BackendRegistry;
use crate::settings::{BackendLink, Settings, AUTOMATION_USER};
use crate::tasks::Services;
use crate::types::{BackendKind, PermissionChange, ProjectClass, ProjectRequest};

pub fn settings() -> Settings {
    let settings = Settings::in_memory();
    settings.set(AUTOMATION_USER, "aperture-bot").unwrap();
    settings
}

pub fn link(settings: &Settings, kind: BackendKind) {
    settings
        .set_link(
            kind,
            Some(BackendLink {
                url: "memory://".into(),
                token: None,
            }),
        )
        .unwrap();
}

pub fn request(issue_key: &str, project_key: &str) -> ProjectRequest {
    ProjectRequest {
        issue_key: issue_key.into(),
        project_key: project_key.into(),
        name: format!("Project {project_key}"),
        description: String::new(),
        requested_by: "alice".into(),
        category: None,
        class: ProjectClass::Software,
        users: vec!["bob".into()],
        groups: vec!["devs".into()],
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    PermissionsChanged(PermissionChange),
    CreationFailed(String),
    /// Project key and who asked for the removal.
    RemovalFailed(String, String),
    ProjectRemoved(String, Vec<String>),
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }

    fn push(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}

impl Notifier for RecordingNotifier {
    fn permissions_changed(&self, change: &PermissionChange) {
        self.push(Notice::PermissionsChanged(change.clone()));
    }

    fn creation_failed(&self, request: &ProjectRequest, _results: &ResultSet) {
        self.push(Notice::CreationFailed(request.project_key.clone()));
    }

    fn removal_failed(&self, project_key: &str, requested_by: &str, _results: &ResultSet) {
        self.push(Notice::RemovalFailed(
            project_key.to_string(),
            requested_by.to_string(),
        ));
    }

    fn project_removed(&self, project_key: &str, members: &[String]) {
        self.push(Notice::ProjectRemoved(
            project_key.to_string(),
            members.to_vec(),
        ));
    }
}

/// Memory backends for a chosen set of kinds, all linked, sharing one log.
pub struct Fixture {
    pub settings: Settings,
    pub log: CallLog,
    pub backends: HashMap<BackendKind, Arc<MemoryBackend>>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Fixture {
    pub fn new(kinds: &[BackendKind]) -> Self {
        Self::with(kinds, |b| b)
    }

    /// Build with `script` applied to every backend before registration.
    pub fn with(kinds: &[BackendKind], script: impl Fn(MemoryBackend) -> MemoryBackend) -> Self {
        let settings = settings();
        let log = CallLog::default();
        let mut backends = HashMap::new();
        for kind in kinds {
            link(&settings, *kind);
            let backend = script(MemoryBackend::with_log(*kind, log.clone()));
            backends.insert(*kind, Arc::new(backend));
        }
        Self {
            settings,
            log,
            backends,
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    /// Replace the backend for `kind` with a scripted one.
    pub fn script(
        &mut self,
        kind: BackendKind,
        script: impl FnOnce(MemoryBackend) -> MemoryBackend,
    ) -> &mut Self {
        let backend = script(MemoryBackend::with_log(kind, self.log.clone()));
        self.backends.insert(kind, Arc::new(backend));
        self
    }

    pub fn backend(&self, kind: BackendKind) -> &MemoryBackend {
        &self.backends[&kind]
    }

    pub fn registry(&self) -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        for backend in self.backends.values() {
            registry.register(Arc::clone(backend) as Arc<dyn Backend>);
        }
        registry
    }

    pub fn provisioner(&self) -> Provisioner {
        Provisioner::new(
            self.registry(),
            self.settings.clone(),
            Arc::new(SettingsIdentity::new(self.settings.clone())),
            self.notifier.clone(),
        )
    }

    /// `(kind, op)` pairs in the order calls were made, across every backend.
    pub fn calls(&self) -> Vec<(BackendKind, crate::backend::memory::Op)> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .map(|c| (c.kind, c.op))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Begin(String),
    Finish(String, String),
    Triage {
        issue: String,
        project: String,
        hint: TriageHint,
    },
}

#[derive(Debug, Default)]
pub struct RecordingWorkflow {
    pub steps: Mutex<Vec<Step>>,
}

impl RecordingWorkflow {
    pub fn steps(&self) -> Vec<Step> {
        self.steps.lock().unwrap().clone()
    }
}

impl TriageWorkflow for RecordingWorkflow {
    fn begin(&self, issue_key: &str) -> crate::error::Result<()> {
        self.steps.lock().unwrap().push(Step::Begin(issue_key.into()));
        Ok(())
    }

    fn finish(&self, issue_key: &str, project_key: &str) -> crate::error::Result<()> {
        self.steps
            .lock()
            .unwrap()
            .push(Step::Finish(issue_key.into(), project_key.into()));
        Ok(())
    }

    fn triage(
        &self,
        issue_key: &str,
        project_key: &str,
        _results: &ResultSet,
        hint: &TriageHint,
    ) -> crate::error::Result<()> {
        self.steps.lock().unwrap().push(Step::Triage {
            issue: issue_key.into(),
            project: project_key.into(),
            hint: hint.clone(),
        });
        Ok(())
    }
}

/// Runner services over a fixture, with requests stored under a temp dir.
pub struct Harness {
    pub dir: TempDir,
    pub requests: Arc<YamlRequestSource>,
    pub workflow: Arc<RecordingWorkflow>,
    pub directory: Arc<StoreDirectory>,
    pub services: Arc<Services>,
}

impl Harness {
    pub fn new(fx: &Fixture) -> Self {
        let dir = TempDir::new().unwrap();
        let requests = Arc::new(YamlRequestSource::new(dir.path()));
        let workflow = Arc::new(RecordingWorkflow::default());
        let directory = Arc::new(StoreDirectory::new(fx.settings.store().clone()));
        let services = Arc::new(Services {
            provisioner: Arc::new(fx.provisioner()),
            requests: requests.clone(),
            workflow: workflow.clone(),
            notifier: fx.notifier.clone(),
            directory: directory.clone(),
        });
        Self {
            dir,
            requests,
            workflow,
            directory,
            services,
        }
    }
}
