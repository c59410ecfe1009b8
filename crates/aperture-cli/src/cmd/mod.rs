pub mod config;
pub mod daemon;
pub mod init;
pub mod jobs;
pub mod schedule;

use anyhow::Context;
use aperture_core::scheduler::{JobDb, ScheduledOperation, Scheduler};
use aperture_core::settings::FileConfigStore;
use aperture_core::{paths, Settings};
use std::path::Path;
use std::sync::Arc;

/// Fail early with a hint when `root` was never initialized.
pub fn require_init(root: &Path) -> anyhow::Result<()> {
    if !paths::aperture_dir(root).is_dir() {
        anyhow::bail!(
            "{} is not an aperture workspace; run `aperture init` first",
            root.display()
        );
    }
    Ok(())
}

pub fn open_settings(root: &Path) -> anyhow::Result<Settings> {
    require_init(root)?;
    let path = paths::settings_path(root);
    let store = FileConfigStore::open(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    Ok(Settings::new(Arc::new(store)))
}

pub fn open_scheduler(root: &Path, settings: Settings) -> anyhow::Result<Scheduler> {
    let path = paths::jobs_db_path(root);
    let db = JobDb::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Scheduler::new(Arc::new(db), settings))
}

/// One table row per job.
pub fn job_row(job: &ScheduledOperation) -> Vec<String> {
    vec![
        job.kind.to_string(),
        job.subject_key.clone(),
        job.status.label().to_string(),
        job.fire_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        job.id.to_string(),
    ]
}

pub const JOB_HEADERS: &[&str] = &["KIND", "SUBJECT", "STATUS", "FIRE AT (UTC)", "ID"];
