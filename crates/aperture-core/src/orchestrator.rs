//! Provisioning orchestrator: create, teardown, permission and idle fan-out
//! across the registered backends.
//!
//! Every backend call runs on the blocking pool under the configured
//! `backend-timeout`. An `Err`, a panic or a timeout from inside a call is an
//! unexpected fault and lands in the returned [`ResultSet`] as a server-error
//! entry; only validation of the orchestrator's own input (project key,
//! automation identity) is returned as `Err`, before any backend is touched.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::collab::{IdentityProvider, Notifier};
use crate::error::{ApertureError, BackendError, BackendResult, Result};
use crate::outcome::{IdleCheckResult, OperationResult, ResultSet};
use crate::paths::validate_project_key;
use crate::registry::BackendRegistry;
use crate::settings::Settings;
use crate::types::{BackendKind, CallContext, PermissionChange, ProjectRequest, Subjects};

/// Run one contract call on the blocking pool, bounded by `limit`.
///
/// A timed-out call keeps its blocking thread until the backend returns; its
/// result is discarded.
async fn guarded<T, F>(
    backend: &Arc<dyn Backend>,
    ctx: &CallContext,
    limit: Duration,
    call: F,
) -> BackendResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Backend, &CallContext) -> BackendResult<T> + Send + 'static,
{
    bounded(backend, ctx, limit, Duration::ZERO, call).await.result
}

/// Outcome of a bounded call. `stray` is the call itself when it had still
/// not returned once the grace period ran out.
struct Settled<T> {
    result: BackendResult<T>,
    stray: Option<JoinHandle<BackendResult<T>>>,
}

/// Like [`guarded`], but after a timeout keep waiting up to `grace` for the
/// call to land, so the caller knows whether it may still take effect.
async fn bounded<T, F>(
    backend: &Arc<dyn Backend>,
    ctx: &CallContext,
    limit: Duration,
    grace: Duration,
    call: F,
) -> Settled<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Backend, &CallContext) -> BackendResult<T> + Send + 'static,
{
    let backend = Arc::clone(backend);
    let ctx = ctx.clone();
    let mut task = tokio::task::spawn_blocking(move || call(backend.as_ref(), &ctx));
    let first = tokio::time::timeout(limit, &mut task).await;
    let result = match first {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(join_fault(join)),
        Err(_) => {
            let landed = !grace.is_zero() && tokio::time::timeout(grace, &mut task).await.is_ok();
            return Settled {
                result: Err(BackendError::Timeout(limit)),
                stray: (!landed).then_some(task),
            };
        }
    };
    Settled { result, stray: None }
}

fn join_fault(e: JoinError) -> BackendError {
    if !e.is_panic() {
        return BackendError::Other(format!("backend call cancelled: {e}"));
    }
    let payload = e.into_panic();
    let message = payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "non-string panic payload".to_string());
    BackendError::Panicked(message)
}

/// Stamp the result with the backend that produced it.
fn owned_by(kind: BackendKind, mut result: OperationResult) -> OperationResult {
    result.kind = kind;
    result
}

/// Best-effort local rollback of one faulted create. Its own failures are
/// logged and never recorded.
async fn compensate(backend: Arc<dyn Backend>, ctx: CallContext, project_key: String, limit: Duration) {
    let kind = backend.kind();
    let key = project_key.clone();
    match guarded(&backend, &ctx, limit, move |b, ctx| b.destroy_service(ctx, &key)).await {
        Ok(result) if result.is_success() => {
            debug!(backend = %kind, project = %project_key, "compensation succeeded");
        }
        Ok(result) => {
            warn!(backend = %kind, project = %project_key, errors = ?result.errors, "compensation rejected");
        }
        Err(e) => {
            warn!(backend = %kind, project = %project_key, error = %e, "compensation faulted");
        }
    }
}

pub struct Provisioner {
    registry: BackendRegistry,
    settings: Settings,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn Notifier>,
}

impl Provisioner {
    pub fn new(
        registry: BackendRegistry,
        settings: Settings,
        identity: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            registry,
            settings,
            identity,
            notifier,
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn context(&self) -> Result<CallContext> {
        Ok(CallContext {
            identity: self.identity.automation_identity()?,
            idle_threshold: self.settings.idle_duration(),
        })
    }

    // -----------------------------------------------------------------------
    // Create
    // -----------------------------------------------------------------------

    /// Create the project on every applicable backend.
    ///
    /// The tracker anchor is created first; the remaining backends are then
    /// created concurrently. Results are in creation order. A rejection on one
    /// backend never stops the others. A fault is recorded and followed by a
    /// `destroy_service` on that backend only; backends that succeeded are
    /// left alone. A timed-out create gets one more `backend-timeout` to
    /// return before it is compensated, and is compensated again if it
    /// returns later still.
    pub async fn create_project(&self, request: &ProjectRequest) -> Result<ResultSet> {
        validate_project_key(&request.project_key)?;
        if request.name.trim().is_empty() {
            return Err(ApertureError::InvalidArgument(format!(
                "project {} has no name",
                request.project_key
            )));
        }
        let ctx = self.context()?;
        let backends = self.registry.for_create(request.class, &self.settings);
        info!(
            project = %request.project_key,
            backends = backends.len(),
            identity = %ctx.identity,
            "creating project"
        );

        let anchors = backends
            .iter()
            .take_while(|b| !b.kind().requires_link())
            .count();
        let (anchor, dependents) = backends.split_at(anchors);

        let mut results = ResultSet::new();
        for backend in anchor {
            results.record(self.create_one(backend, &ctx, request).await);
        }
        let created = join_all(
            dependents
                .iter()
                .map(|backend| self.create_one(backend, &ctx, request)),
        )
        .await;
        for result in created {
            results.record(result);
        }

        if results.is_success() {
            info!(project = %request.project_key, "project created");
        } else {
            warn!(project = %request.project_key, errors = %results, "project creation reported errors");
        }
        Ok(results)
    }

    async fn create_one(
        &self,
        backend: &Arc<dyn Backend>,
        ctx: &CallContext,
        request: &ProjectRequest,
    ) -> OperationResult {
        let kind = backend.kind();
        let limit = self.settings.backend_timeout();
        let owned = request.clone();
        let settled = bounded(backend, ctx, limit, limit, move |b, ctx| {
            b.create_service(ctx, &owned)
        })
        .await;
        match settled.result {
            Ok(result) => {
                if !result.is_success() {
                    warn!(backend = %kind, project = %request.project_key, errors = ?result.errors, "create rejected");
                }
                owned_by(kind, result)
            }
            Err(fault) => {
                warn!(backend = %kind, project = %request.project_key, error = %fault, "create faulted, compensating");
                let key = request.project_key.clone();
                compensate(Arc::clone(backend), ctx.clone(), key.clone(), limit).await;
                if let Some(stray) = settled.stray {
                    // The create may still land; undo it again once it returns.
                    let backend = Arc::clone(backend);
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        let _ = stray.await;
                        warn!(backend = %kind, project = %key, "timed-out create returned, compensating again");
                        compensate(backend, ctx, key, limit).await;
                    });
                }
                OperationResult::server_error(kind, fault.to_string())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Destroy the project on every configured backend, anchor last.
    ///
    /// Runs sequentially in reverse creation order and never short-circuits.
    pub async fn remove_project(&self, project_key: &str) -> Result<ResultSet> {
        validate_project_key(project_key)?;
        let ctx = self.context()?;
        let backends = self.registry.for_teardown(&self.settings);
        info!(project = %project_key, backends = backends.len(), "removing project");

        let limit = self.settings.backend_timeout();
        let mut results = ResultSet::new();
        for backend in &backends {
            let kind = backend.kind();
            let key = project_key.to_string();
            let result =
                match guarded(backend, &ctx, limit, move |b, ctx| b.destroy_service(ctx, &key))
                    .await
                {
                    Ok(result) => owned_by(kind, result),
                    Err(fault) => {
                        warn!(backend = %kind, project = %project_key, error = %fault, "destroy faulted");
                        OperationResult::server_error(kind, fault.to_string())
                    }
                };
            results.record(result);
        }

        if !results.is_success() {
            warn!(project = %project_key, errors = %results, "teardown reported errors");
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Permissions
    // -----------------------------------------------------------------------

    /// Apply an ACL change on every configured backend where the project
    /// exists.
    ///
    /// The notifier is told about user changes that succeeded everywhere they
    /// were applied; group changes are never notified.
    pub async fn modify_permissions(&self, change: &PermissionChange) -> Result<ResultSet> {
        validate_project_key(&change.project_key)?;
        let ctx = self.context()?;
        if change.subjects.is_empty() {
            debug!(project = %change.project_key, "empty permission change, nothing to do");
            return Ok(ResultSet::new());
        }

        let backends = self.registry.configured(&self.settings);
        let applied = join_all(
            backends
                .iter()
                .map(|backend| self.modify_one(backend, &ctx, change)),
        )
        .await;

        let mut results = ResultSet::new();
        for result in applied.into_iter().flatten() {
            results.record(result);
        }

        if results.is_success() {
            info!(
                project = %change.project_key,
                role = %change.role,
                backends = results.entries().len(),
                "permissions updated"
            );
            if matches!(change.subjects, Subjects::Users(_)) && !results.is_empty() {
                self.notifier.permissions_changed(change);
            }
        } else {
            warn!(project = %change.project_key, errors = %results, "permission update reported errors");
        }
        Ok(results)
    }

    /// `None` when the backend has no resource for the project.
    async fn modify_one(
        &self,
        backend: &Arc<dyn Backend>,
        ctx: &CallContext,
        change: &PermissionChange,
    ) -> Option<OperationResult> {
        let kind = backend.kind();
        let limit = self.settings.backend_timeout();
        let key = change.project_key.clone();
        match guarded(backend, ctx, limit, move |b, ctx| b.is_service_available(ctx, &key)).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(backend = %kind, project = %change.project_key, "not provisioned here, skipping");
                return None;
            }
            Err(fault) => {
                warn!(backend = %kind, project = %change.project_key, error = %fault, "availability check faulted");
                return Some(OperationResult::server_error(kind, fault.to_string()));
            }
        }

        let owned = change.clone();
        let outcome = guarded(backend, ctx, limit, move |b, ctx| match &owned.subjects {
            Subjects::Users(users) => {
                b.modify_users(ctx, &owned.project_key, owned.mode, owned.role, users)
            }
            Subjects::Groups(groups) => {
                b.modify_groups(ctx, &owned.project_key, owned.mode, owned.role, groups)
            }
        })
        .await;
        Some(match outcome {
            Ok(result) => owned_by(kind, result),
            Err(fault) => {
                warn!(backend = %kind, project = %change.project_key, error = %fault, "permission change faulted");
                OperationResult::server_error(kind, fault.to_string())
            }
        })
    }

    // -----------------------------------------------------------------------
    // Idle detection
    // -----------------------------------------------------------------------

    /// Ask every configured backend whether the project is idle.
    ///
    /// One answer per backend, in canonical order. A fault yields an answer
    /// of `None` with the error text and does not affect the others.
    pub async fn detect_activity(&self, project_key: &str) -> Result<Vec<IdleCheckResult>> {
        validate_project_key(project_key)?;
        let ctx = self.context()?;
        let backends = self.registry.configured(&self.settings);
        let limit = self.settings.backend_timeout();

        let checks = backends.iter().map(|backend| {
            let kind = backend.kind();
            let key = project_key.to_string();
            let probe = key.clone();
            let ctx = &ctx;
            async move {
                let outcome = guarded(backend, ctx, limit, move |b, ctx| b.is_idle(ctx, &probe)).await;
                match outcome {
                    Ok(idle) => IdleCheckResult {
                        kind,
                        project_key: key,
                        idle: Some(idle),
                        error: None,
                    },
                    Err(fault) => {
                        warn!(backend = %kind, project = %key, error = %fault, "idle check faulted");
                        IdleCheckResult {
                            kind,
                            project_key: key,
                            idle: None,
                            error: Some(fault.to_string()),
                        }
                    }
                }
            }
        });
        Ok(join_all(checks).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::Op;
    use crate::outcome::Severity;
    use crate::settings::BACKEND_TIMEOUT;
    use crate::testing::{request, Fixture, Notice};
    use crate::types::{PermissionMode, ProjectClass, Role};
    use crate::types::BackendKind::*;

    const THREE: &[BackendKind] = &[Tracker, Wiki, SourceControl];

    #[tokio::test]
    async fn rejection_does_not_stop_later_backends() {
        let mut fx = Fixture::new(&[Tracker, Wiki, SourceControl, Review, Build]);
        fx.script(Wiki, |b| b.reject(Op::Create, &["space key taken"]));
        let results = fx
            .provisioner()
            .create_project(&request("REQ-1", "ABC"))
            .await
            .unwrap();

        for kind in BackendKind::all() {
            assert_eq!(fx.backend(*kind).call_count(Op::Create), 1, "{kind}");
        }
        assert_eq!(results.entries().len(), 5);
        assert_eq!(results.first_failed_kind(), Some(Wiki));
        assert_eq!(
            results.get(Wiki).unwrap().severity,
            Some(Severity::Validation)
        );
        // Rejections are not compensated locally.
        assert_eq!(fx.backend(Wiki).call_count(Op::Destroy), 0);
    }

    #[tokio::test]
    async fn fault_compensates_only_the_faulted_backend() {
        let mut fx = Fixture::new(THREE);
        fx.script(Wiki, |b| b.fault(Op::Create));
        let results = fx
            .provisioner()
            .create_project(&request("REQ-1", "ABC"))
            .await
            .unwrap();

        assert_eq!(results.entries().len(), 3);
        assert!(results.get(Tracker).unwrap().is_success());
        assert!(results.get(SourceControl).unwrap().is_success());
        let wiki = results.get(Wiki).unwrap();
        assert_eq!(wiki.errors.len(), 1);
        assert_eq!(wiki.severity, Some(Severity::ServerError));

        assert_eq!(fx.backend(Wiki).call_count(Op::Destroy), 1);
        assert_eq!(fx.backend(Tracker).call_count(Op::Destroy), 0);
        assert_eq!(fx.backend(SourceControl).call_count(Op::Destroy), 0);
        assert!(fx.backend(Tracker).has_project("ABC"));
    }

    #[tokio::test]
    async fn panic_is_captured_as_server_error() {
        let mut fx = Fixture::new(THREE);
        fx.script(SourceControl, |b| b.panic_on(Op::Create));
        let results = fx
            .provisioner()
            .create_project(&request("REQ-1", "ABC"))
            .await
            .unwrap();

        let entry = results.get(SourceControl).unwrap();
        assert_eq!(entry.severity, Some(Severity::ServerError));
        assert!(entry.errors[0].contains("panicked"), "{:?}", entry.errors);
        assert_eq!(fx.backend(SourceControl).call_count(Op::Destroy), 1);
    }

    #[tokio::test]
    async fn timeout_is_a_fault() {
        let mut fx = Fixture::new(&[Tracker, Build]);
        fx.settings.set(BACKEND_TIMEOUT, "1s").unwrap();
        fx.script(Build, |b| b.slow(Op::Create, Duration::from_millis(1500)));
        let results = fx
            .provisioner()
            .create_project(&request("REQ-1", "ABC"))
            .await
            .unwrap();

        let build = results.get(Build).unwrap();
        assert_eq!(build.severity, Some(Severity::ServerError));
        assert!(build.errors[0].contains("timed out"), "{:?}", build.errors);
        // The slow create landed during the grace period and was rolled back.
        assert!(!fx.backend(Build).has_project("ABC"));
        assert_eq!(fx.backend(Build).call_count(Op::Destroy), 1);
        assert!(fx.backend(Tracker).has_project("ABC"));
    }

    #[tokio::test]
    async fn create_landing_after_the_grace_period_is_undone() {
        let mut fx = Fixture::new(&[Tracker, Build]);
        fx.settings.set(BACKEND_TIMEOUT, "1s").unwrap();
        fx.script(Build, |b| b.slow(Op::Create, Duration::from_millis(2500)));
        let results = fx
            .provisioner()
            .create_project(&request("REQ-1", "ABC"))
            .await
            .unwrap();
        assert_eq!(
            results.get(Build).unwrap().severity,
            Some(Severity::ServerError)
        );

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!fx.backend(Build).has_project("ABC"));
        assert_eq!(fx.backend(Build).call_count(Op::Destroy), 2);
    }

    #[tokio::test]
    async fn tracker_is_created_before_dependents() {
        let mut fx = Fixture::new(&[Tracker, Wiki, Review]);
        fx.script(Tracker, |b| b.with_delay(Duration::from_millis(100)));
        fx.provisioner()
            .create_project(&request("REQ-1", "ABC"))
            .await
            .unwrap();

        let calls = fx.calls();
        assert_eq!(calls[0], (Tracker, Op::Create));
        assert_eq!(calls.len(), 3);
    }

    #[tokio::test]
    async fn non_software_project_skips_code_backends() {
        let fx = Fixture::new(&[Tracker, Wiki, SourceControl, Build]);
        let mut req = request("REQ-1", "ABC");
        req.class = ProjectClass::NonSoftware;
        let results = fx.provisioner().create_project(&req).await.unwrap();
        let kinds: Vec<_> = results.entries().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![Tracker, Wiki]);
    }

    #[tokio::test]
    async fn validation_happens_before_any_backend_call() {
        let fx = Fixture::new(THREE);
        let p = fx.provisioner();
        assert!(matches!(
            p.create_project(&request("REQ-1", "bad key")).await,
            Err(ApertureError::InvalidProjectKey(_))
        ));
        assert!(p.remove_project("").await.is_err());

        fx.settings.unset(crate::settings::AUTOMATION_USER).unwrap();
        assert!(matches!(
            p.create_project(&request("REQ-1", "ABC")).await,
            Err(ApertureError::NoAutomationIdentity)
        ));
        assert!(fx.calls().is_empty());
    }

    #[tokio::test]
    async fn no_applicable_backends_is_empty_success() {
        let fx = Fixture::new(&[]);
        let results = fx
            .provisioner()
            .create_project(&request("REQ-1", "ABC"))
            .await
            .unwrap();
        assert!(results.is_empty());
        assert!(results.is_success());
    }

    #[tokio::test]
    async fn teardown_reverses_creation_order_for_every_subset() {
        let optional = [Wiki, SourceControl, Review, Build];
        for mask in 0u8..16 {
            let mut kinds = vec![Tracker];
            kinds.extend(
                optional
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, k)| *k),
            );
            let fx = Fixture::new(&kinds);
            let results = fx.provisioner().remove_project("ABC").await.unwrap();
            assert!(results.is_success());

            let order: Vec<_> = fx.calls().into_iter().map(|(k, _)| k).collect();
            let mut expected = kinds.clone();
            expected.reverse();
            assert_eq!(order, expected, "mask {mask:04b}");
        }
    }

    #[tokio::test]
    async fn teardown_continues_past_failures() {
        let mut fx = Fixture::new(&[Tracker, Wiki, Build]);
        fx.script(Build, |b| b.fault(Op::Destroy));
        fx.script(Wiki, |b| b.reject(Op::Destroy, &["space locked"]));
        let results = fx.provisioner().remove_project("ABC").await.unwrap();

        assert_eq!(fx.backend(Tracker).call_count(Op::Destroy), 1);
        assert_eq!(results.error_count(), 2);
        assert_eq!(
            results.get(Build).unwrap().severity,
            Some(Severity::ServerError)
        );
        assert!(results.get(Tracker).unwrap().is_success());
    }

    #[tokio::test]
    async fn permissions_skip_backends_without_the_project() {
        let mut fx = Fixture::new(&[Tracker, Wiki, Build]);
        fx.script(Tracker, |b| b.seed("ABC"));
        fx.script(Build, |b| b.seed("ABC"));
        let change = PermissionChange::users(
            "ABC",
            PermissionMode::Add,
            Role::Developer,
            vec!["bob".into()],
        );
        let results = fx.provisioner().modify_permissions(&change).await.unwrap();

        assert_eq!(results.entries().len(), 2);
        assert!(results.get(Wiki).is_none());
        assert_eq!(fx.backend(Wiki).call_count(Op::ModifyUsers), 0);
        assert_eq!(
            fx.backend(Build).members("ABC", Role::Developer).0,
            vec!["bob".to_string()]
        );
        assert_eq!(
            fx.notifier.notices(),
            vec![Notice::PermissionsChanged(change)]
        );
    }

    #[tokio::test]
    async fn group_changes_and_failures_are_not_notified() {
        let mut fx = Fixture::new(&[Tracker, Wiki]);
        fx.script(Tracker, |b| b.seed("ABC"));
        fx.script(Wiki, |b| b.seed("ABC").fault(Op::ModifyUsers));
        let p = fx.provisioner();

        let groups = PermissionChange::groups(
            "ABC",
            PermissionMode::Replace,
            Role::User,
            vec!["staff".into()],
        );
        assert!(p.modify_permissions(&groups).await.unwrap().is_success());

        let users = PermissionChange::users(
            "ABC",
            PermissionMode::Remove,
            Role::User,
            vec!["bob".into()],
        );
        let results = p.modify_permissions(&users).await.unwrap();
        assert_eq!(results.first_failed_kind(), Some(Wiki));
        assert!(fx.notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn availability_fault_is_recorded() {
        let mut fx = Fixture::new(&[Tracker]);
        fx.script(Tracker, |b| b.fault(Op::Available));
        let change = PermissionChange::users(
            "ABC",
            PermissionMode::Add,
            Role::Admin,
            vec!["bob".into()],
        );
        let results = fx.provisioner().modify_permissions(&change).await.unwrap();
        assert_eq!(
            results.get(Tracker).unwrap().severity,
            Some(Severity::ServerError)
        );
        assert_eq!(fx.backend(Tracker).call_count(Op::ModifyUsers), 0);
    }

    #[tokio::test]
    async fn idle_fault_does_not_hide_other_answers() {
        let mut fx = Fixture::with(&[Tracker, Wiki, SourceControl, Review], |b| b.idle(true));
        fx.script(Wiki, |b| b.fault(Op::Idle));
        let answers = fx.provisioner().detect_activity("ABC").await.unwrap();

        assert_eq!(answers.len(), 4);
        let answered: Vec<_> = answers.iter().filter(|a| a.idle.is_some()).collect();
        assert_eq!(answered.len(), 3);
        assert!(answered.iter().all(|a| a.idle == Some(true)));
        let wiki = answers.iter().find(|a| a.kind == Wiki).unwrap();
        assert!(wiki.idle.is_none());
        assert!(wiki.error.is_some());
    }

    #[tokio::test]
    async fn idle_threshold_reaches_backends() {
        let fx = Fixture::new(&[Tracker]);
        fx.settings
            .set(crate::settings::IDLE_DURATION, "30d")
            .unwrap();
        let p = fx.provisioner();
        assert_eq!(
            p.context().unwrap().idle_threshold,
            Duration::from_secs(30 * 86_400)
        );
        let answers = p.detect_activity("ABC").await.unwrap();
        assert_eq!(answers[0].idle, Some(false));
    }
}
