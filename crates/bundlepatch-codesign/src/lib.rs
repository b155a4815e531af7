//! Code signature handling for application bundles.
//!
//! This crate wraps the system `codesign` tool behind the [`Signer`] trait so
//! callers can strip, ad-hoc sign and verify bundles without depending on the
//! tool directly. Tests substitute their own [`Signer`] implementations.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

/// Default path to the system signing tool.
pub const CODESIGN_PATH: &str = "/usr/bin/codesign";

/// Identity used for ad-hoc signing (no certificate).
pub const ADHOC_IDENTITY: &str = "-";

/// Metadata preserved when re-signing.
pub const PRESERVED_METADATA: &str = "entitlements,identifier,flags";

/// Result type alias for signing operations.
pub type Result<T> = std::result::Result<T, SignError>;

/// Errors produced by a [`Signer`].
#[derive(Error, Debug)]
pub enum SignError {
    /// The tool ran but reported failure.
    #[error("{command} failed for {path}: {message}")]
    CommandFailed {
        /// Operation that failed (e.g. "codesign --verify").
        command: String,
        /// Path the operation was applied to.
        path: String,
        /// Trimmed stderr of the tool.
        message: String,
    },

    /// The tool could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program that could not be spawned.
        program: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Operations needed to strip and re-apply bundle signatures.
pub trait Signer {
    /// Remove any existing signature from `path`.
    fn remove_signature(&self, path: &Path) -> Result<()>;

    /// Sign `path` ad-hoc, recursing into nested code.
    fn sign_adhoc(&self, path: &Path) -> Result<()>;

    /// Verify the signature on `path`.
    fn verify(&self, path: &Path) -> Result<()>;
}

/// Signing operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodesignCmd {
    Remove,
    Sign,
    Verify,
}

impl CodesignCmd {
    fn label(self) -> &'static str {
        match self {
            CodesignCmd::Remove => "codesign --remove-signature",
            CodesignCmd::Sign => "codesign --sign",
            CodesignCmd::Verify => "codesign --verify",
        }
    }
}

/// [`Signer`] backed by the `codesign` command line tool.
#[derive(Debug, Clone)]
pub struct Codesign {
    program: String,
}

impl Default for Codesign {
    fn default() -> Self {
        Self {
            program: CODESIGN_PATH.to_string(),
        }
    }
}

impl Codesign {
    /// Use a specific signing tool binary.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Path of the signing tool.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Check if the signing tool can be found.
    pub fn is_available(&self) -> bool {
        Path::new(&self.program).exists()
            || Command::new(&self.program)
                .arg("--help")
                .output()
                .is_ok()
    }

    fn command(&self, cmd: CodesignCmd, path: &Path) -> Command {
        let mut command = Command::new(&self.program);
        match cmd {
            CodesignCmd::Remove => {
                command.arg("--remove-signature");
            }
            CodesignCmd::Sign => {
                command.args(["--sign", ADHOC_IDENTITY, "--force", "--deep"]);
                command.arg(format!("--preserve-metadata={}", PRESERVED_METADATA));
            }
            CodesignCmd::Verify => {
                command.args(["--verify", "-vvvv"]);
            }
        }
        command.arg(path);
        command
    }

    fn run(&self, cmd: CodesignCmd, path: &Path) -> Result<()> {
        tracing::debug!(command = cmd.label(), path = %path.display(), "running codesign");

        let output = self
            .command(cmd, path)
            .output()
            .map_err(|source| SignError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SignError::CommandFailed {
                command: cmd.label().to_string(),
                path: path.display().to_string(),
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }
}

impl Signer for Codesign {
    fn remove_signature(&self, path: &Path) -> Result<()> {
        self.run(CodesignCmd::Remove, path)
    }

    fn sign_adhoc(&self, path: &Path) -> Result<()> {
        self.run(CodesignCmd::Sign, path)
    }

    fn verify(&self, path: &Path) -> Result<()> {
        self.run(CodesignCmd::Verify, path)
    }
}

/// Shell commands an operator can run to finish signing and installation by hand.
///
/// `staged` is the patched bundle left on disk, `installed` the path it
/// should end up at.
pub fn remediation_commands(staged: &Path, installed: &Path) -> Vec<String> {
    let staged = quote(staged);
    let installed = quote(installed);
    vec![
        format!(
            "sudo codesign --sign {} --force --deep --preserve-metadata={} {}",
            ADHOC_IDENTITY, PRESERVED_METADATA, staged
        ),
        format!("codesign --verify -vvvv {}", staged),
        format!("sudo rm -rf {}", installed),
        format!("sudo mv {} {}", staged, installed),
    ]
}

/// Single-quote a path for display in a shell command.
fn quote(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}
