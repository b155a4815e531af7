//! Installed application bundle and its target scripts.
//!
//! This module provides the filesystem side of a patch run: locating the
//! bundle and its target files, copying whole trees, and normalizing
//! ownership and permissions.

use crate::config::{Owner, PatchConfig};
use crate::error::{Error, Result};
use crate::patch;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Mode applied to every file and directory of a normalized tree.
pub const NORMALIZED_MODE: u32 = 0o755;

/// An installed application bundle.
#[derive(Debug, Clone)]
pub struct Bundle {
    root: PathBuf,
}

/// A script inside the bundle that is subject to patching.
#[derive(Debug, Clone)]
pub struct TargetFile {
    /// Path relative to the bundle root.
    pub relative: PathBuf,
    /// Absolute path inside the bundle that was scanned.
    pub path: PathBuf,
    /// Raw file content.
    pub content: Vec<u8>,
    /// Whether the patch marker is already present.
    pub marker_present: bool,
}

impl Bundle {
    /// Open an existing bundle.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::BundleNotFound { path: root });
        }
        Ok(Self { root })
    }

    /// Bundle root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name of the bundle (e.g. `App.app`).
    pub fn file_name(&self) -> String {
        self.root
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "bundle".to_string())
    }

    /// Absolute paths of the configured target files.
    pub fn target_paths(&self, config: &PatchConfig) -> Vec<PathBuf> {
        config.targets.iter().map(|t| self.root.join(t)).collect()
    }

    /// Read and scan every target file.
    ///
    /// Fails with [`Error::MissingTargetFiles`] if any target is absent, so
    /// coupled scripts are never patched one without the other.
    pub fn scan_targets(&self, config: &PatchConfig) -> Result<Vec<TargetFile>> {
        let missing: Vec<PathBuf> = self
            .target_paths(config)
            .into_iter()
            .filter(|p| !p.is_file())
            .collect();
        if !missing.is_empty() {
            return Err(Error::MissingTargetFiles { paths: missing });
        }

        config
            .targets
            .iter()
            .map(|relative| TargetFile::read(&self.root, relative, &config.patch.marker))
            .collect()
    }
}

impl TargetFile {
    /// Read `relative` under `root` and check it for `marker`.
    pub fn read(root: &Path, relative: &Path, marker: &str) -> Result<Self> {
        let path = root.join(relative);
        let content = fs::read(&path).map_err(|e| Error::read(&path, e))?;
        let marker_present = patch::has_marker(&content, marker);
        tracing::debug!(path = %path.display(), marker_present, "scanned target");
        Ok(Self {
            relative: relative.to_path_buf(),
            path,
            content,
            marker_present,
        })
    }
}

/// Recursively copy `src` to `dst`, preserving structure, symlinks and modes.
///
/// `dst` must not exist.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(src)?;
    let file_type = metadata.file_type();

    if file_type.is_symlink() {
        copy_symlink(src, dst)
    } else if file_type.is_dir() {
        fs::create_dir(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
        fs::set_permissions(dst, metadata.permissions())
    } else {
        fs::copy(src, dst).map(|_| ())
    }
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(fs::read_link(src)?, dst)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst).map(|_| ())
}

/// Remove a tree if it exists.
pub fn remove_tree(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(m) if m.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Move `src` to `dst`, copying when the paths are on different filesystems.
pub fn move_tree(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            tracing::debug!(from = %src.display(), to = %dst.display(), "cross-device move, copying");
            if let Err(e) = copy_tree(src, dst) {
                if let Err(cleanup) = remove_tree(dst) {
                    tracing::warn!(path = %dst.display(), error = %cleanup, "failed to remove partial copy");
                }
                return Err(e);
            }
            remove_tree(src)
        }
        Err(e) => Err(e),
    }
}

fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EXDEV)
}

/// Recursively set modes (and owner, when given) on every entry under `root`.
///
/// Symlinks are not followed; their targets are normalized where they live.
pub fn normalize_tree(root: &Path, owner: Option<Owner>) -> io::Result<()> {
    let metadata = fs::symlink_metadata(root)?;
    if let Some(owner) = owner {
        chown(root, owner)?;
    }
    if metadata.file_type().is_symlink() {
        return Ok(());
    }

    set_mode(root, NORMALIZED_MODE)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(root)? {
            normalize_tree(&entry?.path(), owner)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn chown(path: &Path, owner: Owner) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains null byte"))?;
    // lchown so symlinks inside the bundle are not followed out of it.
    let ret = unsafe { libc::lchown(c_path.as_ptr(), owner.uid, owner.gid) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn chown(_path: &Path, _owner: Owner) -> io::Result<()> {
    Ok(())
}

/// Hex SHA-256 of a byte buffer.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// SHA-256 over a whole tree: relative paths, symlink targets and file contents,
/// visited in sorted order.
pub fn tree_digest(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    digest_entry(root, Path::new(""), &mut hasher)?;
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

fn digest_entry(path: &Path, relative: &Path, hasher: &mut Sha256) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    hasher.update(relative.to_string_lossy().as_bytes());
    hasher.update([0u8]);

    if metadata.file_type().is_symlink() {
        hasher.update(b"L");
        hasher.update(fs::read_link(path)?.to_string_lossy().as_bytes());
    } else if metadata.is_dir() {
        hasher.update(b"D");
        let mut entries: Vec<_> = fs::read_dir(path)?
            .collect::<io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.file_name())
            .collect();
        entries.sort();
        for name in entries {
            digest_entry(&path.join(&name), &relative.join(&name), hasher)?;
        }
    } else {
        hasher.update(b"F");
        hasher.update(fs::read(path)?);
    }
    hasher.update([0u8]);
    Ok(())
}
