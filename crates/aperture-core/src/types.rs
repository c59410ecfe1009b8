use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ApertureError, Result};

// ---------------------------------------------------------------------------
// BackendKind
// ---------------------------------------------------------------------------

/// Identity of each integrable backend.
///
/// Declaration order is the canonical creation order: the tracker anchors
/// the project and is created first, the rest follow. Teardown walks the
/// same order in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Tracker,
    Wiki,
    SourceControl,
    Review,
    Build,
}

impl BackendKind {
    pub fn all() -> &'static [BackendKind] {
        &[
            BackendKind::Tracker,
            BackendKind::Wiki,
            BackendKind::SourceControl,
            BackendKind::Review,
            BackendKind::Build,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Tracker => "tracker",
            BackendKind::Wiki => "wiki",
            BackendKind::SourceControl => "source-control",
            BackendKind::Review => "review",
            BackendKind::Build => "build",
        }
    }

    /// Optional backends are applicable only once an administrator has
    /// configured a link to them. The tracker is always applicable.
    pub fn requires_link(&self) -> bool {
        !matches!(self, BackendKind::Tracker)
    }

    /// Backends that only make sense for software projects.
    pub fn software_only(&self) -> bool {
        matches!(
            self,
            BackendKind::SourceControl | BackendKind::Review | BackendKind::Build
        )
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ApertureError;

    fn from_str(s: &str) -> Result<Self> {
        BackendKind::all()
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ApertureError::InvalidArgument(format!("unknown backend kind: {s}")))
    }
}

// ---------------------------------------------------------------------------
// ProjectClass
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectClass {
    #[default]
    Software,
    NonSoftware,
}

impl ProjectClass {
    pub fn admits(&self, kind: BackendKind) -> bool {
        match self {
            ProjectClass::Software => true,
            ProjectClass::NonSoftware => !kind.software_only(),
        }
    }
}

// ---------------------------------------------------------------------------
// ProjectRequest
// ---------------------------------------------------------------------------

/// Everything the backends need to provision one project.
///
/// Materialized from the originating issue when a create job fires; the core
/// reads it but never persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectRequest {
    /// Key of the issue that requested the project.
    pub issue_key: String,
    pub project_key: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// User who initiated the request; becomes the project lead.
    pub requested_by: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub class: ProjectClass,
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

// ---------------------------------------------------------------------------
// Identity / CallContext
// ---------------------------------------------------------------------------

/// The principal a backend call is made on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
}

impl Identity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.username)
    }
}

/// Explicit per-call context handed to every capability call.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub identity: Identity,
    /// How long a project must be quiet before a backend calls it idle.
    pub idle_threshold: Duration,
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    Add,
    /// Idempotent add: backends need not clear existing assignments first.
    Replace,
    Remove,
}

impl PermissionMode {
    /// True when the change grants access (ADD and REPLACE).
    pub fn grants(&self) -> bool {
        !matches!(self, PermissionMode::Remove)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Manager,
    QualityAssurance,
    Developer,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "users",
            Role::Manager => "managers",
            Role::QualityAssurance => "qa",
            Role::Developer => "developers",
            Role::Admin => "administrators",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Users or groups, never both in one change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "names", rename_all = "snake_case")]
pub enum Subjects {
    Users(Vec<String>),
    Groups(Vec<String>),
}

impl Subjects {
    pub fn names(&self) -> &[String] {
        match self {
            Subjects::Users(v) | Subjects::Groups(v) => v,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionChange {
    pub project_key: String,
    pub mode: PermissionMode,
    pub role: Role,
    pub subjects: Subjects,
}

impl PermissionChange {
    pub fn users(
        project_key: impl Into<String>,
        mode: PermissionMode,
        role: Role,
        users: Vec<String>,
    ) -> Self {
        Self {
            project_key: project_key.into(),
            mode,
            role,
            subjects: Subjects::Users(users),
        }
    }

    pub fn groups(
        project_key: impl Into<String>,
        mode: PermissionMode,
        role: Role,
        groups: Vec<String>,
    ) -> Self {
        Self {
            project_key: project_key.into(),
            mode,
            role,
            subjects: Subjects::Groups(groups),
        }
    }
}
