//! Patch-and-resign service.
//!
//! [`PatchService::patch_bundle`] runs one patch of an installed bundle:
//!
//! ```text
//! Start -> Checked -> Staged -> SignatureStripped -> ContentPatched -> Signed -> Installed
//!            \__________\______________\__________________\______________\--> RolledBack | Aborted
//! ```
//!
//! All work happens on a copy in a timestamped work directory; the installed
//! bundle is only touched by the final install step, and a backup taken
//! during staging is used to restore it if that step fails.

use crate::bundle::{self, Bundle, TargetFile};
use crate::config::PatchConfig;
use crate::error::{Error, Result};
use crate::patch::{self, SkipReason};
use bundlepatch_codesign::{remediation_commands, Signer};
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Prefix of work directory names under the work root.
const WORK_DIR_PREFIX: &str = "bundlepatch-";

/// State of a patch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchState {
    /// Nothing checked yet.
    Start,
    /// Bundle and targets verified.
    Checked,
    /// Working copy and backup created.
    Staged,
    /// Signatures removed from the working copy.
    SignatureStripped,
    /// At least one target patched in the working copy.
    ContentPatched,
    /// Working copy signed and verified.
    Signed,
    /// Working copy moved into the installation path.
    Installed,
    /// Failed after a backup existed; installation path left as it was.
    RolledBack,
    /// Failed before anything was staged.
    Aborted,
}

impl fmt::Display for PatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PatchState::Start => "start",
            PatchState::Checked => "checked",
            PatchState::Staged => "staged",
            PatchState::SignatureStripped => "signature_stripped",
            PatchState::ContentPatched => "content_patched",
            PatchState::Signed => "signed",
            PatchState::Installed => "installed",
            PatchState::RolledBack => "rolled_back",
            PatchState::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Overall result of a successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every target already carried the marker; nothing was touched.
    AlreadyPatched,
    /// At least one target was patched and the bundle reinstalled.
    Patched,
}

/// What happened to one target file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetStatus {
    /// Marker already present.
    AlreadyPatched,
    /// Fragment inserted at `offset`.
    Patched {
        /// Insertion offset in the original content.
        offset: usize,
    },
    /// Left unchanged.
    Skipped {
        /// Why the file was skipped.
        reason: String,
    },
}

/// Per-target entry of a [`PatchReport`].
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    /// Path relative to the bundle root.
    pub path: PathBuf,
    /// Result for this target.
    #[serde(flatten)]
    pub status: TargetStatus,
}

/// One sign + verify attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SigningAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Whether signing succeeded.
    pub signed: bool,
    /// Whether verification succeeded.
    pub verified: bool,
    /// Error of the failed step, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a successful patch run.
#[derive(Debug, Clone, Serialize)]
pub struct PatchReport {
    /// Installed bundle path.
    pub bundle: PathBuf,
    /// Overall outcome.
    pub outcome: Outcome,
    /// Final state reached.
    pub state: PatchState,
    /// Per-target results.
    pub targets: Vec<TargetReport>,
    /// Non-fatal problems (failed signature strips, skipped targets).
    pub warnings: Vec<String>,
    /// Signing attempts, in order.
    pub signing_attempts: Vec<SigningAttempt>,
}

impl PatchReport {
    /// Number of targets patched in this run.
    pub fn patched_count(&self) -> usize {
        self.targets
            .iter()
            .filter(|t| matches!(t.status, TargetStatus::Patched { .. }))
            .count()
    }
}

/// Final removal and placement of the installed bundle.
pub trait Installer {
    /// Remove the installed bundle.
    fn remove(&self, installed: &Path) -> io::Result<()>;

    /// Move the staged bundle to the installation path.
    fn place(&self, staged: &Path, installed: &Path) -> io::Result<()>;
}

/// [`Installer`] that operates directly on the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsInstaller;

impl Installer for FsInstaller {
    fn remove(&self, installed: &Path) -> io::Result<()> {
        bundle::remove_tree(installed)
    }

    fn place(&self, staged: &Path, installed: &Path) -> io::Result<()> {
        bundle::move_tree(staged, installed)
    }
}

/// Work area for one run.
#[derive(Debug, Clone)]
struct Staging {
    /// Timestamped work directory.
    work_dir: PathBuf,
    /// Bundle copy inside `work_dir` that gets patched.
    working_copy: PathBuf,
    /// Copy of the original bundle, outside `work_dir`.
    backup: PathBuf,
}

impl Staging {
    fn discard(&self) {
        cleanup(&self.work_dir);
        cleanup(&self.backup);
    }
}

/// Patches and re-signs an installed bundle.
pub struct PatchService<'a, S, I = FsInstaller> {
    config: &'a PatchConfig,
    signer: S,
    installer: I,
}

impl<'a, S: Signer> PatchService<'a, S, FsInstaller> {
    /// Create a service that installs directly on the filesystem.
    pub fn new(config: &'a PatchConfig, signer: S) -> Self {
        Self {
            config,
            signer,
            installer: FsInstaller,
        }
    }
}

impl<'a, S: Signer, I: Installer> PatchService<'a, S, I> {
    /// Replace the installer.
    pub fn with_installer<J: Installer>(self, installer: J) -> PatchService<'a, S, J> {
        PatchService {
            config: self.config,
            signer: self.signer,
            installer,
        }
    }

    /// Patch the bundle at `bundle_path`.
    ///
    /// Returns a report on success. A bundle whose targets all carry the
    /// marker is left untouched.
    pub fn patch_bundle(&self, bundle_path: &Path) -> Result<PatchReport> {
        let mut state = PatchState::Start;
        tracing::info!(bundle = %bundle_path.display(), "patching bundle");

        let bundle = Bundle::open(bundle_path)?;
        let targets = bundle.scan_targets(self.config)?;
        transition(&mut state, PatchState::Checked);

        let mut report = PatchReport {
            bundle: bundle.root().to_path_buf(),
            outcome: Outcome::AlreadyPatched,
            state,
            targets: Vec::new(),
            warnings: Vec::new(),
            signing_attempts: Vec::new(),
        };

        let pending: Vec<&TargetFile> = targets.iter().filter(|t| !t.marker_present).collect();
        if pending.is_empty() {
            tracing::info!("all targets already patched, nothing to do");
            report.targets = targets
                .iter()
                .map(|t| TargetReport {
                    path: t.relative.clone(),
                    status: TargetStatus::AlreadyPatched,
                })
                .collect();
            return Ok(report);
        }

        let staging = match self.stage(&bundle) {
            Ok(staging) => staging,
            Err(e) => {
                transition(&mut state, PatchState::Aborted);
                return Err(e);
            }
        };
        transition(&mut state, PatchState::Staged);

        self.strip_signatures(&bundle, &staging, &mut report.warnings);
        transition(&mut state, PatchState::SignatureStripped);

        report.targets = self.patch_targets(&targets, &staging, &mut report.warnings);
        if report.patched_count() == 0 {
            staging.discard();
            transition(&mut state, PatchState::RolledBack);
            let reason = report
                .targets
                .iter()
                .filter_map(|t| match &t.status {
                    TargetStatus::Skipped { reason } => {
                        Some(format!("{}: {}", t.path.display(), reason))
                    }
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(Error::NoFilesPatched {
                bundle: bundle.root().to_path_buf(),
                reason,
            });
        }
        transition(&mut state, PatchState::ContentPatched);

        if let Err(e) = self.sign(&bundle, &staging, &mut report.signing_attempts) {
            // The installed bundle is untouched; only the staged copy is kept.
            cleanup(&staging.backup);
            transition(&mut state, PatchState::RolledBack);
            return Err(e);
        }
        transition(&mut state, PatchState::Signed);

        if let Err(e) = self.install(&bundle, &staging) {
            transition(&mut state, PatchState::RolledBack);
            return Err(e);
        }
        transition(&mut state, PatchState::Installed);

        report.outcome = Outcome::Patched;
        report.state = state;
        tracing::info!(
            bundle = %bundle.root().display(),
            patched = report.patched_count(),
            warnings = report.warnings.len(),
            "bundle patched and re-signed"
        );
        Ok(report)
    }

    /// Copy the bundle into a fresh work directory and to a backup path.
    fn stage(&self, bundle: &Bundle) -> Result<Staging> {
        let stamp = timestamp();
        let name = bundle.file_name();
        let work_dir = self
            .config
            .work_root()
            .join(format!("{}{}", WORK_DIR_PREFIX, stamp));
        let staging = Staging {
            working_copy: work_dir.join(&name),
            backup: self
                .config
                .backup_root()
                .join(format!("{}.backup-{}", name, stamp)),
            work_dir,
        };

        if let Err(e) = self.stage_into(bundle, &staging) {
            staging.discard();
            return Err(e);
        }

        tracing::info!(
            work_dir = %staging.work_dir.display(),
            backup = %staging.backup.display(),
            "staged bundle"
        );
        Ok(staging)
    }

    fn stage_into(&self, bundle: &Bundle, staging: &Staging) -> Result<()> {
        for path in [&staging.work_dir, &staging.backup] {
            if path.exists() {
                tracing::debug!(path = %path.display(), "removing stale staging path");
                bundle::remove_tree(path).map_err(|e| Error::staging(path, e))?;
            }
        }

        std::fs::create_dir_all(&staging.work_dir)
            .map_err(|e| Error::staging(&staging.work_dir, e))?;
        if let Some(parent) = staging.backup.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::staging(parent, e))?;
        }

        bundle::copy_tree(bundle.root(), &staging.working_copy)
            .map_err(|e| Error::staging(&staging.working_copy, e))?;
        bundle::copy_tree(bundle.root(), &staging.backup)
            .map_err(|e| Error::staging(&staging.backup, e))?;

        bundle::normalize_tree(&staging.working_copy, self.config.owner)
            .map_err(|e| Error::staging(&staging.working_copy, e))?;
        Ok(())
    }

    /// Remove signatures from the working copy and its helpers. Best effort.
    fn strip_signatures(&self, bundle: &Bundle, staging: &Staging, warnings: &mut Vec<String>) {
        let mut paths = vec![staging.working_copy.clone()];
        paths.extend(self.config.components.iter().map(|c| staging.working_copy.join(c)));

        for path in paths {
            let result = if path.exists() {
                self.signer
                    .remove_signature(&path)
                    .map_err(|e| e.to_string())
            } else {
                Err("component not found".to_string())
            };

            if let Err(message) = result {
                let shown = match path.strip_prefix(&staging.working_copy) {
                    Ok(relative) if relative.as_os_str().is_empty() => bundle.root().to_path_buf(),
                    Ok(relative) => bundle.root().join(relative),
                    Err(_) => path.clone(),
                };
                tracing::warn!(path = %shown.display(), error = %message, "failed to remove signature");
                warnings.push(format!(
                    "signature not removed from {}: {}",
                    shown.display(),
                    message
                ));
            }
        }
    }

    /// Insert the fragment into every unpatched target of the working copy.
    fn patch_targets(
        &self,
        targets: &[TargetFile],
        staging: &Staging,
        warnings: &mut Vec<String>,
    ) -> Vec<TargetReport> {
        targets
            .iter()
            .map(|target| {
                let status = if target.marker_present {
                    TargetStatus::AlreadyPatched
                } else {
                    match self.patch_target(target, staging) {
                        Ok(offset) => {
                            tracing::info!(path = %target.path.display(), offset, "patched target");
                            TargetStatus::Patched { offset }
                        }
                        Err(reason) => {
                            tracing::warn!(path = %target.path.display(), reason = %reason, "skipping target");
                            warnings.push(format!("{} skipped: {}", target.path.display(), reason));
                            TargetStatus::Skipped { reason }
                        }
                    }
                };
                TargetReport {
                    path: target.relative.clone(),
                    status,
                }
            })
            .collect()
    }

    fn patch_target(&self, target: &TargetFile, staging: &Staging) -> std::result::Result<usize, String> {
        let staged =
            TargetFile::read(&staging.working_copy, &target.relative, &self.config.patch.marker)
                .map_err(|e| e.to_string())?;

        let patched = patch::patch_content(&staged.content, &self.config.patch)
            .map_err(|reason: SkipReason| reason.to_string())?;

        patch::write_replace(&staged.path, &patched.content)
            .map_err(|e| format!("write failed: {}", e))?;
        Ok(patched.offset)
    }

    /// Ad-hoc sign and verify the working copy, retrying per config.
    fn sign(
        &self,
        bundle: &Bundle,
        staging: &Staging,
        attempts: &mut Vec<SigningAttempt>,
    ) -> Result<()> {
        let path = &staging.working_copy;
        let policy = self.config.retry.policy();

        let retried = policy.run(|attempt| {
            let mut record = SigningAttempt {
                attempt,
                signed: false,
                verified: false,
                error: None,
            };
            let result = self.signer.sign_adhoc(path).and_then(|()| {
                record.signed = true;
                self.signer.verify(path)
            });
            match &result {
                Ok(()) => record.verified = true,
                Err(e) => {
                    tracing::warn!(attempt, max = policy.max_attempts(), error = %e, "signing attempt failed");
                    record.error = Some(e.to_string());
                }
            }
            attempts.push(record);
            result
        });

        match retried.result {
            Ok(()) => {
                tracing::info!(attempts = retried.attempts, "signature verified");
                Ok(())
            }
            Err(e) => {
                let remediation = remediation_commands(path, bundle.root());
                tracing::error!(
                    attempts = retried.attempts,
                    staged = %path.display(),
                    error = %e,
                    "signing failed, staged copy kept for manual signing"
                );
                Err(Error::SigningFailed {
                    staged: path.clone(),
                    attempts: retried.attempts,
                    message: e.to_string(),
                    remediation,
                })
            }
        }
    }

    /// Swap the signed working copy into the installation path.
    fn install(&self, bundle: &Bundle, staging: &Staging) -> Result<()> {
        let installed = bundle.root();

        let swapped = self
            .installer
            .remove(installed)
            .and_then(|()| self.installer.place(&staging.working_copy, installed));

        if let Err(e) = swapped {
            tracing::error!(path = %installed.display(), error = %e, "install failed, restoring backup");
            self.restore(installed, &staging.backup);
            cleanup(&staging.work_dir);
            return Err(Error::install(installed, e));
        }

        if let Err(e) = bundle::normalize_tree(installed, self.config.owner) {
            tracing::warn!(path = %installed.display(), error = %e, "failed to normalize installed bundle");
        }
        staging.discard();
        Ok(())
    }

    /// Put the backup back at the installation path.
    ///
    /// On failure the backup is kept and its location logged.
    fn restore(&self, installed: &Path, backup: &Path) {
        let restored = bundle::remove_tree(installed).and_then(|()| bundle::move_tree(backup, installed));
        match restored {
            Ok(()) => tracing::info!(path = %installed.display(), "restored original bundle"),
            Err(e) => tracing::error!(
                path = %installed.display(),
                backup = %backup.display(),
                error = %e,
                "restore failed; original bundle kept at backup path"
            ),
        }
    }
}

/// Read-only view of one target, used by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct TargetInspection {
    /// Path relative to the bundle root.
    pub path: PathBuf,
    /// Whether the file exists.
    pub exists: bool,
    /// Whether the marker is present.
    pub marker_present: bool,
    /// Where the fragment would be inserted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insertion_point: Option<usize>,
    /// Why the fragment could not be inserted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    /// Hex SHA-256 of the file content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Inspect every configured target without modifying anything.
pub fn inspect_bundle(config: &PatchConfig, bundle_path: &Path) -> Result<Vec<TargetInspection>> {
    let bundle = Bundle::open(bundle_path)?;

    config
        .targets
        .iter()
        .map(|relative| {
            let path = bundle.root().join(relative);
            if !path.is_file() {
                return Ok(TargetInspection {
                    path: relative.clone(),
                    exists: false,
                    marker_present: false,
                    insertion_point: None,
                    skip_reason: None,
                    sha256: None,
                });
            }

            let target = TargetFile::read(bundle.root(), relative, &config.patch.marker)?;
            let (insertion_point, skip_reason) = if target.marker_present {
                (None, None)
            } else {
                match patch::insertion_point(&target.content, &config.patch) {
                    Ok(offset) => (Some(offset), None),
                    Err(reason) => (None, Some(reason)),
                }
            };

            Ok(TargetInspection {
                path: relative.clone(),
                exists: true,
                marker_present: target.marker_present,
                insertion_point,
                skip_reason,
                sha256: Some(bundle::sha256_hex(&target.content)),
            })
        })
        .collect()
}

fn transition(state: &mut PatchState, next: PatchState) {
    tracing::debug!(from = %state, to = %next, "state transition");
    *state = next;
}

/// Best-effort removal of a staging path.
fn cleanup(path: &Path) {
    if let Err(e) = bundle::remove_tree(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to clean up");
    }
}

/// Compact UTC timestamp for staging names, e.g. `20261018T093000Z`.
fn timestamp() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now())
        .to_string()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::tree_digest;
    use bundlepatch_codesign::SignError;
    use std::cell::{Cell, RefCell};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    const MAIN_JS: &str = "Contents/Resources/app/out/main.js";
    const ELECTRON_MAIN_JS: &str = "Contents/Resources/app/out/vs/code/electron-main/main.js";
    const SCRIPT: &[u8] =
        b"function id(){case 'x': switch(a){ return ioreg('IOPlatformUUID') }}\nmodule.exports=id;";

    /// Signer that records calls and fails verification a set number of times.
    #[derive(Default)]
    struct FakeSigner {
        verify_failures: Cell<u32>,
        sign_always_fails: bool,
        strip_always_fails: bool,
        removed: RefCell<Vec<PathBuf>>,
        signs: Cell<u32>,
    }

    impl FakeSigner {
        fn failing_verify(times: u32) -> Self {
            Self {
                verify_failures: Cell::new(times),
                ..Default::default()
            }
        }

        fn failing_sign() -> Self {
            Self {
                sign_always_fails: true,
                ..Default::default()
            }
        }

        fn failing_strip() -> Self {
            Self {
                strip_always_fails: true,
                ..Default::default()
            }
        }

        fn fail(command: &str, path: &Path) -> SignError {
            SignError::CommandFailed {
                command: command.to_string(),
                path: path.display().to_string(),
                message: "resource busy".to_string(),
            }
        }
    }

    impl Signer for &FakeSigner {
        fn remove_signature(&self, path: &Path) -> bundlepatch_codesign::Result<()> {
            self.removed.borrow_mut().push(path.to_path_buf());
            if self.strip_always_fails {
                return Err(FakeSigner::fail("codesign --remove-signature", path));
            }
            Ok(())
        }

        fn sign_adhoc(&self, path: &Path) -> bundlepatch_codesign::Result<()> {
            self.signs.set(self.signs.get() + 1);
            if self.sign_always_fails {
                return Err(FakeSigner::fail("codesign --sign", path));
            }
            Ok(())
        }

        fn verify(&self, path: &Path) -> bundlepatch_codesign::Result<()> {
            let left = self.verify_failures.get();
            if left > 0 {
                self.verify_failures.set(left - 1);
                return Err(FakeSigner::fail("codesign --verify", path));
            }
            Ok(())
        }
    }

    /// Installer whose move step always fails after the original is removed.
    struct FailingPlace;

    impl Installer for FailingPlace {
        fn remove(&self, installed: &Path) -> io::Result<()> {
            bundle::remove_tree(installed)
        }

        fn place(&self, _staged: &Path, _installed: &Path) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "simulated move failure"))
        }
    }

    struct Fixture {
        _dir: TempDir,
        bundle: PathBuf,
        work_root: PathBuf,
        backup_root: PathBuf,
        config: PatchConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let bundle = dir.path().join("Applications").join("Test.app");
            let work_root = dir.path().join("work");
            let backup_root = dir.path().join("backups");
            fs::create_dir_all(&work_root).unwrap();
            fs::create_dir_all(&backup_root).unwrap();

            let mut config = PatchConfig::for_app("Test");
            config.work_root = Some(work_root.clone());
            config.backup_root = Some(backup_root.clone());
            config.retry.delay = Duration::ZERO;

            let fixture = Self {
                _dir: dir,
                bundle,
                work_root,
                backup_root,
                config,
            };
            fixture.write(MAIN_JS, SCRIPT);
            fixture.write(ELECTRON_MAIN_JS, SCRIPT);
            fixture.write("Contents/Info.plist", b"<plist/>");
            fixture.write(
                "Contents/Frameworks/Test Helper (GPU).app/Contents/Info.plist",
                b"<plist/>",
            );
            fixture
        }

        fn write(&self, relative: &str, content: &[u8]) {
            let path = self.bundle.join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        fn read(&self, relative: &str) -> Vec<u8> {
            fs::read(self.bundle.join(relative)).unwrap()
        }

        fn is_empty(dir: &Path) -> bool {
            fs::read_dir(dir).unwrap().next().is_none()
        }

        fn expected_patch(&self, content: &[u8]) -> Vec<u8> {
            let offset = patch::rfind(
                &content[..patch::find(content, b"IOPlatformUUID").unwrap()],
                b"switch",
            )
            .unwrap();
            let mut expected = content[..offset].to_vec();
            expected.extend_from_slice(self.config.patch.fragment.as_bytes());
            expected.push(b'\n');
            expected.extend_from_slice(&content[offset..]);
            expected
        }
    }

    #[test]
    fn test_patches_both_targets_and_cleans_up() {
        let fx = Fixture::new();
        let signer = FakeSigner::default();

        let report = PatchService::new(&fx.config, &signer)
            .patch_bundle(&fx.bundle)
            .unwrap();

        assert_eq!(report.outcome, Outcome::Patched);
        assert_eq!(report.state, PatchState::Installed);
        assert_eq!(report.patched_count(), 2);
        assert_eq!(fx.read(MAIN_JS), fx.expected_patch(SCRIPT));
        assert_eq!(fx.read(ELECTRON_MAIN_JS), fx.expected_patch(SCRIPT));
        assert_eq!(fx.read("Contents/Info.plist"), b"<plist/>");

        assert_eq!(report.signing_attempts.len(), 1);
        assert!(Fixture::is_empty(&fx.work_root), "work directory should be removed");
        assert!(Fixture::is_empty(&fx.backup_root), "backup should be removed");
    }

    #[test]
    fn test_strip_warns_for_missing_components() {
        let fx = Fixture::new();
        let signer = FakeSigner::default();

        let report = PatchService::new(&fx.config, &signer)
            .patch_bundle(&fx.bundle)
            .unwrap();

        // Root and the one helper that exists were stripped.
        assert_eq!(signer.removed.borrow().len(), 2);
        // Plugin, Renderer and main helper are absent.
        let strip_warnings: Vec<_> = report
            .warnings
            .iter()
            .filter(|w| w.contains("signature not removed"))
            .collect();
        assert_eq!(strip_warnings.len(), 3);
        assert!(strip_warnings.iter().all(|w| w.contains("component not found")));
    }

    #[test]
    fn test_strip_failure_is_a_warning() {
        let fx = Fixture::new();
        let signer = FakeSigner::failing_strip();

        let report = PatchService::new(&fx.config, &signer)
            .patch_bundle(&fx.bundle)
            .unwrap();

        assert_eq!(report.outcome, Outcome::Patched);
        assert_eq!(report.state, PatchState::Installed);
        assert_eq!(fx.read(MAIN_JS), fx.expected_patch(SCRIPT));

        let busy: Vec<_> = report
            .warnings
            .iter()
            .filter(|w| w.contains("signature not removed") && w.contains("resource busy"))
            .collect();
        // Bundle root and the GPU helper exist; the signer failed on both.
        assert_eq!(busy.len(), 2);
        let root_warning = format!("signature not removed from {}:", fx.bundle.display());
        assert!(busy.iter().any(|w| w.starts_with(&root_warning)), "{busy:?}");
        assert_eq!(signer.signs.get(), 1);
    }

    #[test]
    fn test_staging_failure_removes_partial_work_dir() {
        let mut fx = Fixture::new();
        // A regular file where the backup directory should be.
        let blocked = fx.backup_root.join("not-a-dir");
        fs::write(&blocked, b"x").unwrap();
        fx.config.backup_root = Some(blocked.clone());
        let original = tree_digest(&fx.bundle).unwrap();
        let signer = FakeSigner::default();

        let err = PatchService::new(&fx.config, &signer)
            .patch_bundle(&fx.bundle)
            .unwrap_err();

        match err {
            Error::StagingFailed { path, .. } => assert!(path.starts_with(&blocked), "{}", path.display()),
            other => panic!("unexpected error: {other}"),
        }
        assert!(Fixture::is_empty(&fx.work_root), "partial work directory should be removed");
        assert_eq!(fs::read(&blocked).unwrap(), b"x");
        assert_eq!(tree_digest(&fx.bundle).unwrap(), original);
        assert!(signer.removed.borrow().is_empty());
        assert_eq!(signer.signs.get(), 0);
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let fx = Fixture::new();
        let signer = FakeSigner::default();
        let service = PatchService::new(&fx.config, &signer);

        service.patch_bundle(&fx.bundle).unwrap();
        let digest = tree_digest(&fx.bundle).unwrap();
        let signs = signer.signs.get();
        let strips = signer.removed.borrow().len();

        let report = service.patch_bundle(&fx.bundle).unwrap();
        assert_eq!(report.outcome, Outcome::AlreadyPatched);
        assert_eq!(report.state, PatchState::Checked);
        assert!(report
            .targets
            .iter()
            .all(|t| t.status == TargetStatus::AlreadyPatched));
        assert_eq!(tree_digest(&fx.bundle).unwrap(), digest);
        assert_eq!(signer.signs.get(), signs, "no signing on a no-op run");
        assert_eq!(signer.removed.borrow().len(), strips);
        assert!(Fixture::is_empty(&fx.work_root));
        assert!(Fixture::is_empty(&fx.backup_root), "no backup on a no-op run");
    }

    #[test]
    fn test_target_without_needle_is_left_unchanged() {
        let fx = Fixture::new();
        let plain = b"function id(){ switch(a){ return 1 } }";
        fx.write(ELECTRON_MAIN_JS, plain);
        let signer = FakeSigner::default();

        let report = PatchService::new(&fx.config, &signer)
            .patch_bundle(&fx.bundle)
            .unwrap();

        assert_eq!(report.patched_count(), 1);
        assert_eq!(fx.read(ELECTRON_MAIN_JS), plain);
        assert_eq!(fx.read(MAIN_JS), fx.expected_patch(SCRIPT));
        assert!(matches!(
            report.targets[1].status,
            TargetStatus::Skipped { .. }
        ));
        assert!(report.warnings.iter().any(|w| w.contains("skipped")));
    }

    #[test]
    fn test_only_unpatched_target_is_modified() {
        let fx = Fixture::new();
        let already = fx.expected_patch(SCRIPT);
        fx.write(MAIN_JS, &already);
        let signer = FakeSigner::default();

        let report = PatchService::new(&fx.config, &signer)
            .patch_bundle(&fx.bundle)
            .unwrap();

        assert_eq!(report.targets[0].status, TargetStatus::AlreadyPatched);
        assert!(matches!(report.targets[1].status, TargetStatus::Patched { .. }));
        assert_eq!(fx.read(MAIN_JS), already, "patched target must not be patched twice");
    }

    #[test]
    fn test_no_files_patched_discards_staging() {
        let fx = Fixture::new();
        fx.write(MAIN_JS, b"no identifier here");
        fx.write(ELECTRON_MAIN_JS, b"IOPlatformUUID without anchor");
        let digest = tree_digest(&fx.bundle).unwrap();
        let signer = FakeSigner::default();

        let err = PatchService::new(&fx.config, &signer)
            .patch_bundle(&fx.bundle)
            .unwrap_err();

        match err {
            Error::NoFilesPatched { reason, .. } => {
                assert!(reason.contains("IOPlatformUUID"));
                assert!(reason.contains("switch"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(signer.signs.get(), 0);
        assert_eq!(tree_digest(&fx.bundle).unwrap(), digest);
        assert!(Fixture::is_empty(&fx.work_root));
        assert!(Fixture::is_empty(&fx.backup_root));
    }

    #[test]
    fn test_missing_targets_leave_bundle_untouched() {
        let fx = Fixture::new();
        fs::remove_file(fx.bundle.join(MAIN_JS)).unwrap();
        fs::remove_file(fx.bundle.join(ELECTRON_MAIN_JS)).unwrap();
        let digest = tree_digest(&fx.bundle).unwrap();
        let signer = FakeSigner::default();

        let err = PatchService::new(&fx.config, &signer)
            .patch_bundle(&fx.bundle)
            .unwrap_err();

        match err {
            Error::MissingTargetFiles { paths } => assert_eq!(paths.len(), 2),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(tree_digest(&fx.bundle).unwrap(), digest);
        assert!(Fixture::is_empty(&fx.work_root));
    }

    #[test]
    fn test_one_missing_target_aborts_without_patching() {
        let fx = Fixture::new();
        fs::remove_file(fx.bundle.join(ELECTRON_MAIN_JS)).unwrap();
        let signer = FakeSigner::default();

        let err = PatchService::new(&fx.config, &signer)
            .patch_bundle(&fx.bundle)
            .unwrap_err();

        assert!(matches!(err, Error::MissingTargetFiles { .. }));
        assert_eq!(fx.read(MAIN_JS), SCRIPT);
    }

    #[test]
    fn test_missing_bundle() {
        let fx = Fixture::new();
        let signer = FakeSigner::default();

        let err = PatchService::new(&fx.config, &signer)
            .patch_bundle(&fx.bundle.with_file_name("Other.app"))
            .unwrap_err();
        assert!(matches!(err, Error::BundleNotFound { .. }));
    }

    #[test]
    fn test_signing_retries_transient_verify_failures() {
        let fx = Fixture::new();
        let signer = FakeSigner::failing_verify(2);

        let report = PatchService::new(&fx.config, &signer)
            .patch_bundle(&fx.bundle)
            .unwrap();

        assert_eq!(report.signing_attempts.len(), 3);
        assert!(report.signing_attempts[0].signed);
        assert!(!report.signing_attempts[0].verified);
        assert!(!report.signing_attempts[1].verified);
        assert!(report.signing_attempts[2].verified);
        assert_eq!(report.state, PatchState::Installed);
        assert_eq!(fx.read(MAIN_JS), fx.expected_patch(SCRIPT));
    }

    #[test]
    fn test_signing_exhaustion_keeps_staged_copy() {
        let fx = Fixture::new();
        let digest = tree_digest(&fx.bundle).unwrap();
        let signer = FakeSigner::failing_sign();

        let err = PatchService::new(&fx.config, &signer)
            .patch_bundle(&fx.bundle)
            .unwrap_err();

        match err {
            Error::SigningFailed {
                staged,
                attempts,
                remediation,
                ..
            } => {
                assert_eq!(attempts, 3);
                assert!(staged.starts_with(&fx.work_root));
                assert!(staged.join(MAIN_JS).exists(), "staged copy kept for inspection");
                assert_eq!(fs::read(staged.join(MAIN_JS)).unwrap(), fx.expected_patch(SCRIPT));
                assert!(remediation.iter().any(|c| c.contains("codesign --sign -")));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(signer.signs.get(), 3);
        assert_eq!(tree_digest(&fx.bundle).unwrap(), digest, "installed bundle untouched");
        assert!(Fixture::is_empty(&fx.backup_root));
    }

    #[test]
    fn test_install_failure_restores_original() {
        let fx = Fixture::new();
        let digest = tree_digest(&fx.bundle).unwrap();
        let signer = FakeSigner::default();

        let err = PatchService::new(&fx.config, &signer)
            .with_installer(FailingPlace)
            .patch_bundle(&fx.bundle)
            .unwrap_err();

        match &err {
            Error::InstallFailed { path, .. } => assert_eq!(path, &fx.bundle),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("simulated move failure"));
        assert_eq!(tree_digest(&fx.bundle).unwrap(), digest);
        assert!(Fixture::is_empty(&fx.work_root), "no staging directory should remain");
        assert!(Fixture::is_empty(&fx.backup_root));
    }

    #[test]
    fn test_stale_staging_paths_are_replaced() {
        let fx = Fixture::new();
        let signer = FakeSigner::default();
        let service = PatchService::new(&fx.config, &signer);
        let bundle = Bundle::open(&fx.bundle).unwrap();

        let work_dir = fx.work_root.join("bundlepatch-fixed");
        let staging = Staging {
            working_copy: work_dir.join("Test.app"),
            backup: fx.backup_root.join("Test.app.backup-fixed"),
            work_dir,
        };
        fs::create_dir_all(staging.working_copy.join("stale")).unwrap();
        fs::create_dir_all(staging.backup.join("stale")).unwrap();

        service.stage_into(&bundle, &staging).unwrap();

        assert!(!staging.working_copy.join("stale").exists());
        assert!(staging.working_copy.join(MAIN_JS).exists());
        assert_eq!(
            tree_digest(&staging.backup).unwrap(),
            tree_digest(&fx.bundle).unwrap()
        );
        staging.discard();
        assert!(Fixture::is_empty(&fx.work_root));
    }

    #[test]
    fn test_inspect_reports_targets() {
        let fx = Fixture::new();
        fx.write(ELECTRON_MAIN_JS, b"nothing");

        let inspection = inspect_bundle(&fx.config, &fx.bundle).unwrap();
        assert_eq!(inspection.len(), 2);
        assert!(inspection[0].exists);
        assert!(!inspection[0].marker_present);
        assert_eq!(
            inspection[0].insertion_point,
            patch::insertion_point(SCRIPT, &fx.config.patch).ok()
        );
        assert_eq!(
            inspection[0].sha256.as_deref(),
            Some(bundle::sha256_hex(SCRIPT).as_str())
        );
        assert!(matches!(
            inspection[1].skip_reason,
            Some(SkipReason::NeedleMissing { .. })
        ));
    }

    #[test]
    fn test_report_serializes_to_json() {
        let fx = Fixture::new();
        let signer = FakeSigner::default();
        let report = PatchService::new(&fx.config, &signer)
            .patch_bundle(&fx.bundle)
            .unwrap();

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "patched");
        assert_eq!(json["state"], "installed");
        assert_eq!(json["targets"][0]["status"], "patched");
        assert!(json["targets"][0]["offset"].is_u64());
    }

    #[test]
    fn test_timestamp_is_compact() {
        let stamp = timestamp();
        assert!(stamp.chars().all(|c| c.is_ascii_alphanumeric()));
        assert!(stamp.ends_with('Z'));
        assert_eq!(stamp.len(), "20261018T093000Z".len());
    }
}
