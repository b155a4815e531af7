//! bundlepatch configuration.
//!
//! A single [`PatchConfig`] is built at startup (config file, then CLI
//! overrides) and passed by reference to every operation. It describes the
//! bundle layout, the patch rule and the signing retry policy.

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config file storage.
const APP_NAME: &str = "bundlepatch";

/// Config file name inside the config directory.
const CONFIG_FILENAME: &str = "config.toml";

/// Default application the layout describes.
const DEFAULT_APP_NAME: &str = "Cursor";

/// Literal that marks a patched script.
pub const DEFAULT_MARKER: &str = "// machine-id-reset";

/// Statement inserted ahead of the identifier lookup.
pub const DEFAULT_FRAGMENT: &str = "return crypto.randomUUID(); // machine-id-reset";

/// Token the fragment is inserted in front of.
pub const DEFAULT_ANCHOR: &str = "switch";

/// Token identifying the identifier lookup the anchor must precede.
pub const DEFAULT_NEEDLE: &str = "IOPlatformUUID";

/// Script files patched inside the bundle, relative to the bundle root.
const DEFAULT_TARGETS: [&str; 2] = [
    "Contents/Resources/app/out/main.js",
    "Contents/Resources/app/out/vs/code/electron-main/main.js",
];

/// Helper bundle suffixes under `Contents/Frameworks`.
const HELPER_SUFFIXES: [&str; 4] = [
    " Helper (GPU)",
    " Helper (Plugin)",
    " Helper (Renderer)",
    " Helper",
];

/// Global bundlepatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Configuration format version.
    pub version: u8,

    /// Display name of the application.
    pub app_name: String,

    /// Installed bundle path.
    pub bundle_path: PathBuf,

    /// Process name checked before patching.
    pub process_name: String,

    /// Target script files, relative to the bundle root.
    pub targets: Vec<PathBuf>,

    /// Nested bundles whose signatures are stripped, relative to the bundle root.
    pub components: Vec<PathBuf>,

    /// Directory that holds timestamped work directories (default: system temp dir).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_root: Option<PathBuf>,

    /// Directory that holds the ephemeral install backup (default: system temp dir).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_root: Option<PathBuf>,

    /// Invoking non-elevated user, resolved at startup.
    #[serde(skip)]
    pub owner: Option<Owner>,

    /// Insertion rule for target scripts.
    pub patch: PatchRule,

    /// Signing retry settings.
    pub retry: RetrySettings,
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self::for_app(DEFAULT_APP_NAME)
    }
}

/// How a fragment is inserted into a target script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PatchRule {
    /// Literal whose presence means the script is already patched.
    pub marker: String,
    /// First token: the fragment goes in front of its last occurrence before the needle.
    pub anchor: String,
    /// Second token: the identifier lookup being redirected.
    pub needle: String,
    /// Statement inserted at the insertion point (followed by a newline).
    pub fragment: String,
}

impl Default for PatchRule {
    fn default() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_string(),
            anchor: DEFAULT_ANCHOR.to_string(),
            needle: DEFAULT_NEEDLE.to_string(),
            fragment: DEFAULT_FRAGMENT.to_string(),
        }
    }
}

/// Retry settings for the signing step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum sign+verify attempts.
    pub max_attempts: u32,
    /// Fixed delay between attempts (e.g. "1s", "500ms").
    #[serde(with = "duration_str")]
    pub delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetrySettings {
    /// Build the retry policy these settings describe.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.delay)
    }
}

/// User and group that own the installed bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    /// User ID.
    pub uid: u32,
    /// Group ID.
    pub gid: u32,
}

impl Owner {
    /// Resolve the invoking user when running under `sudo`.
    ///
    /// Returns `None` when not elevated; files created by the process are
    /// then already owned by the right user.
    pub fn from_env() -> Option<Self> {
        Self::from_vars(
            std::env::var("SUDO_UID").ok().as_deref(),
            std::env::var("SUDO_GID").ok().as_deref(),
        )
    }

    fn from_vars(uid: Option<&str>, gid: Option<&str>) -> Option<Self> {
        let uid = uid?.trim().parse().ok()?;
        let gid = gid?.trim().parse().ok()?;
        Some(Self { uid, gid })
    }
}

impl PatchConfig {
    /// Default layout for an application named `app_name`.
    pub fn for_app(app_name: &str) -> Self {
        let components = HELPER_SUFFIXES
            .iter()
            .map(|suffix| {
                PathBuf::from("Contents/Frameworks").join(format!("{}{}.app", app_name, suffix))
            })
            .collect();

        Self {
            version: 1,
            app_name: app_name.to_string(),
            bundle_path: PathBuf::from("/Applications").join(format!("{}.app", app_name)),
            process_name: app_name.to_string(),
            targets: DEFAULT_TARGETS.iter().map(PathBuf::from).collect(),
            components,
            work_root: None,
            backup_root: None,
            owner: None,
            patch: PatchRule::default(),
            retry: RetrySettings::default(),
        }
    }

    /// Path of the config file.
    ///
    /// On macOS: `~/Library/Application Support/bundlepatch/config.toml`
    /// On Linux: `~/.config/bundlepatch/config.toml`
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| Error::config("could not determine config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILENAME))
    }

    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write configuration to a specific file, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::ConfigSave(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::ConfigSave(format!("{}: {}", parent.display(), e)))?;
        }
        std::fs::write(path, format!("{}{}", CONFIG_HEADER, content))
            .map_err(|e| Error::ConfigSave(format!("{}: {}", path.display(), e)))
    }

    /// Check that the configuration can drive a patch run.
    pub fn validate(&self) -> Result<()> {
        if self.targets.is_empty() {
            return Err(Error::config("at least one target file is required"));
        }
        if let Some(target) = self.targets.iter().find(|t| t.is_absolute()) {
            return Err(Error::config(format!(
                "target {} must be relative to the bundle root",
                target.display()
            )));
        }
        let rule = &self.patch;
        if rule.marker.is_empty() || rule.anchor.is_empty() || rule.needle.is_empty() {
            return Err(Error::config("patch marker, anchor and needle must be non-empty"));
        }
        if !rule.fragment.contains(&rule.marker) {
            return Err(Error::config(format!(
                "patch fragment must contain the marker {:?}",
                rule.marker
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be at least 1"));
        }
        Ok(())
    }

    /// Directory for work directories.
    pub fn work_root(&self) -> PathBuf {
        self.work_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Directory for the install backup.
    pub fn backup_root(&self) -> PathBuf {
        self.backup_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Header written above a generated config file.
const CONFIG_HEADER: &str = "# bundlepatch configuration
#
# targets and components are relative to bundle_path.
# The patch fragment must contain the marker so repeated runs are no-ops.
# retry.delay accepts human-readable durations such as \"1s\" or \"500ms\".

";

/// Serde adapter for human-readable durations.
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
