//! Configuration store collaborator and the typed settings view over it.
//!
//! The store is a namespaced string key/value map. It is read on every
//! orchestration and written by administrators and by the directory of
//! provisioned projects. Both implementations take a shared lock for reads;
//! writes replace single keys, so concurrent writers of different keys
//! never undo each other.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration;
use crate::error::{ApertureError, Result};
use crate::io::atomic_write;
use crate::types::{BackendKind, Identity};

// ---------------------------------------------------------------------------
// Keys and defaults
// ---------------------------------------------------------------------------

pub const DELETE_DURATION: &str = "delete-duration";
pub const IDLE_DURATION: &str = "idle-duration";
pub const IDLE_INTERVAL: &str = "idle-interval";
pub const AUTOMATION_USER: &str = "automation-user";
pub const NOTIFICATION_EMAIL: &str = "notification-email";
pub const COMPENSATION_POLICY: &str = "compensation-policy";
pub const BACKEND_TIMEOUT: &str = "backend-timeout";
pub const TICK_INTERVAL: &str = "tick-interval";

pub const DEFAULT_DELETE_DURATION: &str = "2w";
pub const DEFAULT_IDLE_DURATION: &str = "90d";
pub const DEFAULT_IDLE_INTERVAL: &str = "1w";
pub const DEFAULT_BACKEND_TIMEOUT: &str = "2m";
pub const DEFAULT_TICK_INTERVAL: &str = "5s";

pub fn link_key(kind: BackendKind) -> String {
    format!("link.{kind}")
}

pub fn link_token_key(kind: BackendKind) -> String {
    format!("link.{kind}.token")
}

pub fn lead_key(kind: BackendKind) -> String {
    format!("lead.{kind}")
}

// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Namespace {
    Global,
    Project(String),
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Global => f.write_str("global"),
            Namespace::Project(key) => write!(f, "project:{key}"),
        }
    }
}

/// Durable key/value storage, namespaced globally and per project.
pub trait ConfigStore: Send + Sync {
    fn get(&self, ns: &Namespace, key: &str) -> Result<Option<String>>;

    /// Store `value`, returning the previous value.
    fn put(&self, ns: &Namespace, key: &str, value: &str) -> Result<Option<String>>;

    /// Delete `key`, returning the previous value.
    fn remove(&self, ns: &Namespace, key: &str) -> Result<Option<String>>;

    /// Every key/value in a namespace, sorted by key.
    fn entries(&self, ns: &Namespace) -> Result<Vec<(String, String)>>;
}

fn poisoned<T>(_: T) -> ApertureError {
    ApertureError::ConfigStore("lock poisoned".into())
}

// ---------------------------------------------------------------------------
// MemoryConfigStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: RwLock<HashMap<Namespace, BTreeMap<String, String>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, ns: &Namespace, key: &str) -> Result<Option<String>> {
        let values = self.values.read().map_err(poisoned)?;
        Ok(values.get(ns).and_then(|m| m.get(key)).cloned())
    }

    fn put(&self, ns: &Namespace, key: &str, value: &str) -> Result<Option<String>> {
        let mut values = self.values.write().map_err(poisoned)?;
        Ok(values
            .entry(ns.clone())
            .or_default()
            .insert(key.to_string(), value.to_string()))
    }

    fn remove(&self, ns: &Namespace, key: &str) -> Result<Option<String>> {
        let mut values = self.values.write().map_err(poisoned)?;
        Ok(values.get_mut(ns).and_then(|m| m.remove(key)))
    }

    fn entries(&self, ns: &Namespace) -> Result<Vec<(String, String)>> {
        let values = self.values.read().map_err(poisoned)?;
        Ok(values
            .get(ns)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// FileConfigStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    global: BTreeMap<String, String>,
    #[serde(default)]
    projects: BTreeMap<String, BTreeMap<String, String>>,
}

impl StoreFile {
    fn namespace(&self, ns: &Namespace) -> Option<&BTreeMap<String, String>> {
        match ns {
            Namespace::Global => Some(&self.global),
            Namespace::Project(key) => self.projects.get(key),
        }
    }

    fn namespace_mut(&mut self, ns: &Namespace) -> &mut BTreeMap<String, String> {
        match ns {
            Namespace::Global => &mut self.global,
            Namespace::Project(key) => self.projects.entry(key.clone()).or_default(),
        }
    }
}

/// YAML-file-backed store.
///
/// Other processes write the same file, so nothing is cached: every read
/// loads the file, and every change reloads, edits and atomically rewrites
/// it while holding the write lock.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    lock: RwLock<()>,
}

impl FileConfigStore {
    /// Open the store at `path`; a missing file is an empty store.
    pub fn open(path: &Path) -> Result<Self> {
        let store = Self {
            path: path.to_path_buf(),
            lock: RwLock::new(()),
        };
        store.load()?;
        Ok(store)
    }

    fn load(&self) -> Result<StoreFile> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(StoreFile::default()),
            Err(e) => return Err(e.into()),
        };
        if data.trim().is_empty() {
            return Ok(StoreFile::default());
        }
        Ok(serde_yaml::from_str(&data)?)
    }

    fn persist(&self, file: &StoreFile) -> Result<()> {
        let data = serde_yaml::to_string(file)?;
        atomic_write(&self.path, data.as_bytes())
    }
}

impl ConfigStore for FileConfigStore {
    fn get(&self, ns: &Namespace, key: &str) -> Result<Option<String>> {
        let _read = self.lock.read().map_err(poisoned)?;
        let file = self.load()?;
        Ok(file.namespace(ns).and_then(|m| m.get(key)).cloned())
    }

    fn put(&self, ns: &Namespace, key: &str, value: &str) -> Result<Option<String>> {
        let _write = self.lock.write().map_err(poisoned)?;
        let mut file = self.load()?;
        let previous = file
            .namespace_mut(ns)
            .insert(key.to_string(), value.to_string());
        self.persist(&file)?;
        Ok(previous)
    }

    fn remove(&self, ns: &Namespace, key: &str) -> Result<Option<String>> {
        let _write = self.lock.write().map_err(poisoned)?;
        let mut file = self.load()?;
        let previous = file.namespace_mut(ns).remove(key);
        if let Namespace::Project(project) = ns {
            if file.projects.get(project).is_some_and(|m| m.is_empty()) {
                file.projects.remove(project);
            }
        }
        if previous.is_some() {
            self.persist(&file)?;
        }
        Ok(previous)
    }

    fn entries(&self, ns: &Namespace) -> Result<Vec<(String, String)>> {
        let _read = self.lock.read().map_err(poisoned)?;
        let file = self.load()?;
        Ok(file
            .namespace(ns)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// CompensationPolicy
// ---------------------------------------------------------------------------

/// What the create runner does when provisioning reports any error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompensationPolicy {
    /// Tear down every configured backend for the project.
    #[default]
    Teardown,
    /// Rely on the per-backend compensation of faulted creates only.
    FaultedOnly,
}

impl CompensationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationPolicy::Teardown => "teardown",
            CompensationPolicy::FaultedOnly => "faulted-only",
        }
    }
}

impl FromStr for CompensationPolicy {
    type Err = ApertureError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "teardown" => Ok(CompensationPolicy::Teardown),
            "faulted-only" => Ok(CompensationPolicy::FaultedOnly),
            other => Err(ApertureError::InvalidArgument(format!(
                "unknown compensation policy: {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// A configured connection to one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendLink {
    pub url: String,
    pub token: Option<String>,
}

/// Typed accessors over a [`ConfigStore`].
///
/// Malformed durations and policies fall back to their defaults instead of
/// failing the caller.
#[derive(Clone)]
pub struct Settings {
    store: Arc<dyn ConfigStore>,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings").finish_non_exhaustive()
    }
}

impl Settings {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryConfigStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.store.get(&Namespace::Global, key)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<Option<String>> {
        self.store.put(&Namespace::Global, key, value)
    }

    pub fn unset(&self, key: &str) -> Result<Option<String>> {
        self.store.remove(&Namespace::Global, key)
    }

    fn duration_or(&self, key: &str, default: &str) -> Duration {
        let raw = self.get(key).unwrap_or_else(|e| {
            tracing::warn!(key, error = %e, "failed to read setting");
            None
        });
        duration::parse_or(raw.as_deref(), default)
    }

    /// Undo window between scheduling a removal and running it.
    pub fn delete_duration(&self) -> Duration {
        self.duration_or(DELETE_DURATION, DEFAULT_DELETE_DURATION)
    }

    pub fn idle_duration(&self) -> Duration {
        self.duration_or(IDLE_DURATION, DEFAULT_IDLE_DURATION)
    }

    pub fn idle_interval(&self) -> Duration {
        self.duration_or(IDLE_INTERVAL, DEFAULT_IDLE_INTERVAL)
    }

    pub fn backend_timeout(&self) -> Duration {
        self.duration_or(BACKEND_TIMEOUT, DEFAULT_BACKEND_TIMEOUT)
    }

    pub fn tick_interval(&self) -> Duration {
        self.duration_or(TICK_INTERVAL, DEFAULT_TICK_INTERVAL)
    }

    pub fn automation_user(&self) -> Result<Option<Identity>> {
        Ok(self
            .get(AUTOMATION_USER)?
            .filter(|u| !u.trim().is_empty())
            .map(Identity::new))
    }

    pub fn notification_email(&self) -> Result<Option<String>> {
        self.get(NOTIFICATION_EMAIL)
    }

    pub fn compensation_policy(&self) -> CompensationPolicy {
        match self.get(COMPENSATION_POLICY) {
            Ok(Some(raw)) => raw.parse().unwrap_or_else(|e| {
                tracing::warn!(value = %raw, error = %e, "invalid compensation policy, using default");
                CompensationPolicy::default()
            }),
            Ok(None) => CompensationPolicy::default(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read compensation policy");
                CompensationPolicy::default()
            }
        }
    }

    pub fn link(&self, kind: BackendKind) -> Result<Option<BackendLink>> {
        let Some(url) = self.get(&link_key(kind))?.filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let token = self.get(&link_token_key(kind))?;
        Ok(Some(BackendLink { url, token }))
    }

    pub fn is_linked(&self, kind: BackendKind) -> bool {
        match self.link(kind) {
            Ok(link) => link.is_some(),
            Err(e) => {
                tracing::warn!(backend = %kind, error = %e, "failed to read backend link");
                false
            }
        }
    }

    pub fn set_link(&self, kind: BackendKind, link: Option<BackendLink>) -> Result<()> {
        match link {
            Some(link) => {
                self.set(&link_key(kind), &link.url)?;
                match link.token {
                    Some(token) => self.set(&link_token_key(kind), &token)?,
                    None => self.unset(&link_token_key(kind))?,
                };
            }
            None => {
                self.unset(&link_key(kind))?;
                self.unset(&link_token_key(kind))?;
            }
        }
        Ok(())
    }

    /// Username responsible for triaging failures of `kind`, if configured.
    pub fn service_lead(&self, kind: BackendKind) -> Result<Option<String>> {
        self.get(&lead_key(kind))
    }
}
