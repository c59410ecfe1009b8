pub mod backend;
pub mod collab;
pub mod duration;
pub mod error;
pub mod io;
pub mod orchestrator;
pub mod outcome;
pub mod paths;
pub mod registry;
pub mod scheduler;
pub mod settings;
pub mod tasks;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ApertureError, BackendError, Result};
pub use orchestrator::Provisioner;
pub use outcome::{IdleCheckResult, OperationResult, ResultSet, Severity};
pub use registry::BackendRegistry;
pub use settings::Settings;
