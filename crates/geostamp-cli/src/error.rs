//! Error types for the CLI.

use geostamp::GeoError;

#[derive(thiserror::Error, Debug)]
pub enum CliError {
    #[error("Invalid config {path}: {reason}")]
    Config { path: String, reason: String },

    #[error("Invalid scenario {path}: {reason}")]
    Scenario { path: String, reason: String },

    #[error("Usage: {0}")]
    Usage(String),

    #[error(transparent)]
    Geo(#[from] GeoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage(_) => 2,
            CliError::Config { .. } | CliError::Scenario { .. } => 3,
            CliError::Geo(e) if e.is_acquisition_failure() => 4,
            _ => 1,
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;
