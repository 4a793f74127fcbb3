use std::path::PathBuf;

use thiserror::Error;

use crate::probe::TimeoutError;

#[derive(Error, Debug)]
pub enum CovrunError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{tool} is not installed. Install with: {hint}")]
    ToolMissing { tool: String, hint: String },

    #[error(
        "Port {port} is already in use. \
         Please stop the process using it or choose a different port."
    )]
    PortInUse { port: u16 },

    #[error(transparent)]
    ReadinessTimeout(#[from] TimeoutError),

    #[error("Failed to execute `{command}`: {reason}")]
    WorkloadExecution { command: String, reason: String },

    #[error("`{command}` failed ({status}): {stderr}")]
    ToolFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Environment validation failed for {mode} coverage")]
    EnvironmentNotReady { mode: String },
}

pub type Result<T> = std::result::Result<T, CovrunError>;
