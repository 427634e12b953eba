//! Error types for a builder run

use thiserror::Error;
use winbuild_core::script::ScriptKind;

/// Process exit code for a failed build step
pub const EXIT_BUILD_FAILED: u8 = 1;

/// Process exit code for invalid configuration
pub const EXIT_INVALID_CONFIG: u8 = 2;

/// Errors that can stop a builder run
///
/// Every variant stops the run and no further versions are attempted.
/// [`BuildError::Teardown`] is the exception after the last version, where it
/// is only recorded in the run report.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Configuration rejected before any worker was provisioned
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to provision Windows {version} instance {worker}")]
    Provisioning {
        version: String,
        worker: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error connecting to Windows {version} instance {worker} ({host})")]
    Connectivity {
        version: String,
        worker: String,
        host: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error copying workspace to Windows {version} instance {worker} ({host})")]
    Transfer {
        version: String,
        worker: String,
        host: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Error executing {script} script on Windows {version} instance {worker} ({host})")]
    RemoteExecution {
        version: String,
        worker: String,
        host: String,
        script: ScriptKind,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to shut down Windows {version} instance {worker} ({host})")]
    Teardown {
        version: String,
        worker: String,
        host: String,
        #[source]
        source: anyhow::Error,
    },
}

impl BuildError {
    /// Version tag the error belongs to, if any
    pub fn version(&self) -> Option<&str> {
        match self {
            Self::Config(_) => None,
            Self::Provisioning { version, .. }
            | Self::Connectivity { version, .. }
            | Self::Transfer { version, .. }
            | Self::RemoteExecution { version, .. }
            | Self::Teardown { version, .. } => Some(version),
        }
    }

    /// Exit code the process should terminate with
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => EXIT_INVALID_CONFIG,
            _ => EXIT_BUILD_FAILED,
        }
    }
}
