//! Error types for bundlepatch.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using bundlepatch's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while patching a bundle.
#[derive(Error, Debug)]
pub enum Error {
    // Patch lifecycle errors
    /// The bundle root does not exist.
    #[error("bundle not found: {}", path.display())]
    BundleNotFound {
        /// Bundle path that was checked.
        path: PathBuf,
    },

    /// One or more target files are missing from the bundle.
    #[error("missing target files: {}", display_paths(paths))]
    MissingTargetFiles {
        /// Every target path that was not found.
        paths: Vec<PathBuf>,
    },

    /// Copying the bundle into the work or backup area failed.
    #[error("staging failed at {}: {source}", path.display())]
    StagingFailed {
        /// Path being written when the failure happened.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Reading a file inside the bundle failed.
    #[error("failed to read {}: {source}", path.display())]
    ReadFailed {
        /// File or tree being read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// No target file could be patched.
    #[error("no files patched in {}: {reason}", bundle.display())]
    NoFilesPatched {
        /// Bundle that was being patched.
        bundle: PathBuf,
        /// Why each target was skipped.
        reason: String,
    },

    /// Re-signing did not verify within the retry budget.
    #[error(
        "signing failed after {attempts} attempts, staged bundle left at {}: {message}",
        staged.display()
    )]
    SigningFailed {
        /// Patched working copy left on disk for inspection.
        staged: PathBuf,
        /// Number of attempts made.
        attempts: u32,
        /// Last signing error.
        message: String,
        /// Commands an operator can run to finish by hand.
        remediation: Vec<String>,
    },

    /// Swapping the patched bundle into place failed.
    #[error("install failed at {}: {source}", path.display())]
    InstallFailed {
        /// Installation path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    // Configuration errors
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load configuration.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// Failed to save configuration.
    #[error("failed to save config: {0}")]
    ConfigSave(String),

    // Command execution errors
    /// External command failed.
    #[error("command failed: {command}: {message}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
    },

    /// The application is still running.
    #[error("{name} is running (pid {pid}); quit it before patching")]
    AppRunning {
        /// Process name that was matched.
        name: String,
        /// First matching process ID.
        pid: i32,
    },

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error with a message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a staging error for `path`.
    pub fn staging(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StagingFailed {
            path: path.into(),
            source,
        }
    }

    /// Create a read error for `path`.
    pub fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ReadFailed {
            path: path.into(),
            source,
        }
    }

    /// Create an install error for `path`.
    pub fn install(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::InstallFailed {
            path: path.into(),
            source,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
