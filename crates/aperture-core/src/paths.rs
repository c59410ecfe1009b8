use crate::error::{ApertureError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const APERTURE_DIR: &str = ".aperture";
pub const REQUESTS_DIR: &str = ".aperture/requests";

pub const SETTINGS_FILE: &str = ".aperture/settings.yaml";
pub const JOBS_DB_FILE: &str = ".aperture/jobs.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn aperture_dir(root: &Path) -> PathBuf {
    root.join(APERTURE_DIR)
}

pub fn settings_path(root: &Path) -> PathBuf {
    root.join(SETTINGS_FILE)
}

pub fn jobs_db_path(root: &Path) -> PathBuf {
    root.join(JOBS_DB_FILE)
}

pub fn requests_dir(root: &Path) -> PathBuf {
    root.join(REQUESTS_DIR)
}

pub fn request_path(root: &Path, issue_key: &str) -> PathBuf {
    requests_dir(root).join(format!("{issue_key}.yaml"))
}

// ---------------------------------------------------------------------------
// Key validation
// ---------------------------------------------------------------------------

static PROJECT_KEY_RE: OnceLock<Regex> = OnceLock::new();

fn project_key_re() -> &'static Regex {
    PROJECT_KEY_RE.get_or_init(|| Regex::new(r"^[A-Z][A-Z0-9_]{1,9}$").unwrap())
}

pub fn validate_project_key(key: &str) -> Result<()> {
    if !project_key_re().is_match(key) {
        return Err(ApertureError::InvalidProjectKey(key.to_string()));
    }
    Ok(())
}

/// Issue keys are only checked for shape-safety: they become file names.
pub fn validate_issue_key(key: &str) -> Result<()> {
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ApertureError::InvalidArgument(format!(
            "invalid issue key '{key}'"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
