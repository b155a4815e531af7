//! Script patching over raw bytes.
//!
//! The insertion point is the start of the last `anchor` occurrence that
//! begins before the first `needle` occurrence. The fragment and a newline
//! are inserted there; every other byte is left as is.
//!
//! Only the first `needle` occurrence is considered. Files with several
//! unrelated `anchor`/`needle` pairs may be patched at the wrong site.

use crate::config::PatchRule;
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::path::Path;

/// Why a script could not be patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// The needle does not occur in the file.
    NeedleMissing {
        /// Needle that was searched for.
        needle: String,
    },
    /// No anchor starts before the first needle.
    AnchorMissing {
        /// Anchor that was searched for.
        anchor: String,
        /// Needle it had to precede.
        needle: String,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NeedleMissing { needle } => write!(f, "{:?} not found", needle),
            SkipReason::AnchorMissing { anchor, needle } => {
                write!(f, "no {:?} before first {:?}", anchor, needle)
            }
        }
    }
}

/// Script content with the fragment inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patched {
    /// Byte offset the fragment was inserted at.
    pub offset: usize,
    /// New file content.
    pub content: Vec<u8>,
}

/// Find the first occurrence of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Find the last occurrence of `needle` in `haystack`.
pub fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Check whether `content` already carries the patch marker.
pub fn has_marker(content: &[u8], marker: &str) -> bool {
    find(content, marker.as_bytes()).is_some()
}

/// Locate the insertion point for `rule` in `content`.
pub fn insertion_point(content: &[u8], rule: &PatchRule) -> Result<usize, SkipReason> {
    let anchor = rule.anchor.as_bytes();
    let needle_at = find(content, rule.needle.as_bytes()).ok_or_else(|| {
        SkipReason::NeedleMissing {
            needle: rule.needle.clone(),
        }
    })?;

    // Anchor must start strictly before the needle; it may overlap it.
    let end = (needle_at + anchor.len().saturating_sub(1)).min(content.len());
    rfind(&content[..end], anchor).ok_or_else(|| SkipReason::AnchorMissing {
        anchor: rule.anchor.clone(),
        needle: rule.needle.clone(),
    })
}

/// Insert the fragment of `rule` into `content`.
pub fn patch_content(content: &[u8], rule: &PatchRule) -> Result<Patched, SkipReason> {
    let offset = insertion_point(content, rule)?;

    let mut patched = Vec::with_capacity(content.len() + rule.fragment.len() + 1);
    patched.extend_from_slice(&content[..offset]);
    patched.extend_from_slice(rule.fragment.as_bytes());
    patched.push(b'\n');
    patched.extend_from_slice(&content[offset..]);

    Ok(Patched {
        offset,
        content: patched,
    })
}

/// Replace `path` with `content` via a temporary sibling file.
///
/// The original file's permissions are carried over. Empty content is
/// refused and leaves `path` untouched.
pub fn write_replace(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if content.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("refusing to write empty content to {}", path.display()),
        ));
    }

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.flush()?;

    if let Ok(metadata) = std::fs::metadata(path) {
        std::fs::set_permissions(temp.path(), metadata.permissions())?;
    }

    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
