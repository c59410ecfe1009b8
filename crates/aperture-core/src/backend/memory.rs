//! In-process backend.
//!
//! Keeps projects and ACLs in memory. Used for dry runs (`memory://` links)
//! and as the scriptable fake in tests: failures, faults, panics and delays
//! can be injected per operation, and every call is recorded.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{BackendError, BackendResult};
use crate::outcome::OperationResult;
use crate::types::{BackendKind, CallContext, PermissionMode, ProjectRequest, Role};

use super::Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Destroy,
    ModifyUsers,
    ModifyGroups,
    Available,
    Idle,
}

/// One recorded call: which backend, which operation, which project, as whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub kind: BackendKind,
    pub op: Op,
    pub project_key: String,
    pub identity: String,
}

/// Call log that several backends can share to observe global ordering.
pub type CallLog = Arc<Mutex<Vec<Call>>>;

#[derive(Debug, Default)]
struct Acl {
    users: BTreeSet<String>,
    groups: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct State {
    projects: HashMap<String, HashMap<Role, Acl>>,
    rejections: HashMap<Op, Vec<String>>,
    faults: HashSet<Op>,
    panics: HashSet<Op>,
    delays: HashMap<Op, Duration>,
    idle: bool,
}

#[derive(Debug)]
pub struct MemoryBackend {
    kind: BackendKind,
    state: Mutex<State>,
    log: CallLog,
    delay: Option<Duration>,
}

impl MemoryBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self::with_log(kind, CallLog::default())
    }

    pub fn with_log(kind: BackendKind, log: CallLog) -> Self {
        Self {
            kind,
            state: Mutex::new(State::default()),
            log,
            delay: None,
        }
    }

    /// Sleep this long inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sleep this long inside `op` only, overriding [`Self::with_delay`].
    pub fn slow(self, op: Op, delay: Duration) -> Self {
        self.lock().delays.insert(op, delay);
        self
    }

    /// Answer `op` with a validation failure carrying `messages`.
    pub fn reject(self, op: Op, messages: &[&str]) -> Self {
        self.lock()
            .rejections
            .insert(op, messages.iter().map(|m| m.to_string()).collect());
        self
    }

    /// Answer `op` with an unexpected fault.
    pub fn fault(self, op: Op) -> Self {
        self.lock().faults.insert(op);
        self
    }

    /// Panic inside `op`.
    pub fn panic_on(self, op: Op) -> Self {
        self.lock().panics.insert(op);
        self
    }

    pub fn idle(self, idle: bool) -> Self {
        self.lock().idle = idle;
        self
    }

    /// Pretend the resource for `project_key` already exists.
    pub fn seed(self, project_key: &str) -> Self {
        self.lock()
            .projects
            .entry(project_key.to_string())
            .or_default();
        self
    }

    /// Calls made against this backend, oldest first.
    pub fn calls(&self) -> Vec<Call> {
        self.log
            .lock()
            .map(|log| log.iter().filter(|c| c.kind == self.kind).cloned().collect())
            .unwrap_or_default()
    }

    pub fn call_count(&self, op: Op) -> usize {
        self.calls().iter().filter(|c| c.op == op).count()
    }

    pub fn has_project(&self, project_key: &str) -> bool {
        self.lock().projects.contains_key(project_key)
    }

    pub fn members(&self, project_key: &str, role: Role) -> (Vec<String>, Vec<String>) {
        let state = self.lock();
        state
            .projects
            .get(project_key)
            .and_then(|roles| roles.get(&role))
            .map(|acl| {
                (
                    acl.users.iter().cloned().collect(),
                    acl.groups.iter().cloned().collect(),
                )
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic injected while the lock is held must not wedge later calls.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record the call, then apply injected delay, panic, fault or rejection.
    fn enter(&self, ctx: &CallContext, op: Op, project_key: &str) -> BackendResult<Option<Vec<String>>> {
        if let Ok(mut log) = self.log.lock() {
            log.push(Call {
                kind: self.kind,
                op,
                project_key: project_key.to_string(),
                identity: ctx.identity.username.clone(),
            });
        }
        let delay = self.lock().delays.get(&op).copied().or(self.delay);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let (panics, faults, rejection) = {
            let state = self.lock();
            (
                state.panics.contains(&op),
                state.faults.contains(&op),
                state.rejections.get(&op).cloned(),
            )
        };
        if panics {
            panic!("{} backend exploded during {op:?}", self.kind);
        }
        if faults {
            return Err(BackendError::Transport(format!(
                "{} backend unreachable",
                self.kind
            )));
        }
        Ok(rejection)
    }

    fn modify(
        &self,
        ctx: &CallContext,
        op: Op,
        project_key: &str,
        mode: PermissionMode,
        role: Role,
        names: &[String],
    ) -> BackendResult<OperationResult> {
        if let Some(messages) = self.enter(ctx, op, project_key)? {
            return Ok(OperationResult::rejected(self.kind, messages));
        }
        let mut state = self.lock();
        let Some(roles) = state.projects.get_mut(project_key) else {
            return Ok(OperationResult::rejected(
                self.kind,
                [format!("no such project: {project_key}")],
            ));
        };
        let acl = roles.entry(role).or_default();
        let set = if op == Op::ModifyUsers {
            &mut acl.users
        } else {
            &mut acl.groups
        };
        for name in names {
            if mode.grants() {
                set.insert(name.clone());
            } else {
                set.remove(name);
            }
        }
        Ok(OperationResult::ok(self.kind))
    }
}

impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn create_service(
        &self,
        ctx: &CallContext,
        request: &ProjectRequest,
    ) -> BackendResult<OperationResult> {
        if let Some(messages) = self.enter(ctx, Op::Create, &request.project_key)? {
            return Ok(OperationResult::rejected(self.kind, messages));
        }
        self.lock()
            .projects
            .entry(request.project_key.clone())
            .or_default();
        Ok(OperationResult::ok(self.kind))
    }

    fn destroy_service(
        &self,
        ctx: &CallContext,
        project_key: &str,
    ) -> BackendResult<OperationResult> {
        if let Some(messages) = self.enter(ctx, Op::Destroy, project_key)? {
            return Ok(OperationResult::rejected(self.kind, messages));
        }
        self.lock().projects.remove(project_key);
        Ok(OperationResult::ok(self.kind))
    }

    fn modify_users(
        &self,
        ctx: &CallContext,
        project_key: &str,
        mode: PermissionMode,
        role: Role,
        users: &[String],
    ) -> BackendResult<OperationResult> {
        self.modify(ctx, Op::ModifyUsers, project_key, mode, role, users)
    }

    fn modify_groups(
        &self,
        ctx: &CallContext,
        project_key: &str,
        mode: PermissionMode,
        role: Role,
        groups: &[String],
    ) -> BackendResult<OperationResult> {
        self.modify(ctx, Op::ModifyGroups, project_key, mode, role, groups)
    }

    fn is_service_available(&self, ctx: &CallContext, project_key: &str) -> BackendResult<bool> {
        self.enter(ctx, Op::Available, project_key)?;
        Ok(self.lock().projects.contains_key(project_key))
    }

    fn is_idle(&self, ctx: &CallContext, project_key: &str) -> BackendResult<bool> {
        self.enter(ctx, Op::Idle, project_key)?;
        Ok(self.lock().idle)
    }
}
