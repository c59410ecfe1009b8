use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApertureError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid project key '{0}': must be 2-10 uppercase letters, digits or underscores, starting with a letter")]
    InvalidProjectKey(String),

    #[error("invalid duration '{0}': expected a combination of Nw Nd Nh Nm Ns")]
    InvalidDuration(String),

    #[error("no automation identity configured: set 'automation-user'")]
    NoAutomationIdentity,

    #[error("project request not found for issue: {0}")]
    RequestNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("removal already scheduled for project {project_key} at {fire_at}")]
    RemovalAlreadyScheduled { project_key: String, fire_at: String },

    #[error("job store error: {0}")]
    JobDb(String),

    #[error("scheduling failed: {0}")]
    Scheduling(String),

    #[error("config store error: {0}")]
    ConfigStore(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ApertureError>;

/// An unexpected fault raised from inside a backend call.
///
/// Anything a backend reports through this type (or by panicking) is folded
/// into a server-error entry of the operation's `ResultSet`; it never escapes
/// the orchestrator during fan-out.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("unexpected HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode backend response: {0}")]
    Decode(String),

    #[error("backend call timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend call panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            BackendError::Decode(e.to_string())
        } else {
            BackendError::Transport(e.to_string())
        }
    }
}
