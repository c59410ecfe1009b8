use anyhow::Context;
use aperture_core::backend::{Backend, MemoryBackend, RestBackend};
use aperture_core::collab::{
    SettingsIdentity, StoreDirectory, TracingNotifier, TracingWorkflow, YamlRequestSource,
};
use aperture_core::tasks::{self, Services};
use aperture_core::types::BackendKind;
use aperture_core::{BackendRegistry, Provisioner, Settings};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::{open_scheduler, open_settings};

/// Link URL scheme that selects the in-process backend.
const MEMORY_SCHEME: &str = "memory://";

pub fn run(root: &Path) -> anyhow::Result<()> {
    let settings = open_settings(root)?;
    if settings.automation_user()?.is_none() {
        anyhow::bail!("no automation identity: run `aperture config set automation-user <USER>`");
    }
    let registry = build_registry(&settings)?;

    let notifier = Arc::new(TracingNotifier::new(settings.clone()));
    let provisioner = Provisioner::new(
        registry,
        settings.clone(),
        Arc::new(SettingsIdentity::new(settings.clone())),
        notifier.clone(),
    );
    let services = Arc::new(Services {
        provisioner: Arc::new(provisioner),
        requests: Arc::new(YamlRequestSource::new(root)),
        workflow: Arc::new(TracingWorkflow),
        notifier,
        directory: Arc::new(StoreDirectory::new(settings.store().clone())),
    });
    let scheduler = tasks::install(open_scheduler(root, settings)?, services);

    // Nothing runs before this process starts, so every Running job is stale.
    scheduler
        .recover(Duration::ZERO)
        .context("failed to recover interrupted jobs")?;
    scheduler
        .ensure_idle_scan()
        .context("failed to register idle scan")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
            }
            let _ = tx.send(true);
        });
        scheduler.run(rx).await
    })?;
    Ok(())
}

/// Backends are connected from their links on demand, so `config link`
/// and `config unlink` take effect while the daemon runs.
fn build_registry(settings: &Settings) -> anyhow::Result<BackendRegistry> {
    for &kind in BackendKind::all() {
        if !kind.requires_link() && settings.link(kind)?.is_none() {
            anyhow::bail!("{kind} is not linked: run `aperture config link {kind} <URL>`");
        }
    }
    let live = settings.clone();
    Ok(BackendRegistry::connecting(move |kind, link| -> Arc<dyn Backend> {
        if link.url.starts_with(MEMORY_SCHEME) {
            tracing::warn!(backend = %kind, "using in-process backend, nothing is provisioned remotely");
            Arc::new(MemoryBackend::new(kind))
        } else {
            tracing::info!(backend = %kind, url = %link.url, "backend linked");
            Arc::new(RestBackend::new(kind, link.clone()).with_timeout(live.backend_timeout()))
        }
    }))
}
