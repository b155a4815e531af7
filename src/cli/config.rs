//! Configuration CLI commands.
//!
//! Commands for inspecting and creating the bundlepatch config file.

use bundlepatch::config::PatchConfig;
use bundlepatch::{Error, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration commands
#[derive(Subcommand, Debug)]
pub enum ConfigCmd {
    /// Show the effective configuration
    Show(ShowCmd),

    /// Show the path to the configuration file
    Path,

    /// Create a configuration file with the default layout
    Init(InitCmd),
}

impl ConfigCmd {
    /// Execute the config command. `path` overrides the default config location.
    pub fn run(self, path: Option<&Path>) -> Result<()> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => PatchConfig::config_path()?,
        };

        match self {
            ConfigCmd::Show(cmd) => cmd.run(&path),
            ConfigCmd::Path => {
                println!("{}", path.display());
                Ok(())
            }
            ConfigCmd::Init(cmd) => cmd.run(&path),
        }
    }
}

// ============================================================================
// Show Command
// ============================================================================

/// Show the effective configuration
#[derive(Args, Debug)]
pub struct ShowCmd {}

impl ShowCmd {
    pub fn run(self, path: &Path) -> Result<()> {
        let config = if path.exists() {
            PatchConfig::load_from(path)?
        } else {
            PatchConfig::default()
        };

        println!("Config file: {}", path.display());
        if path.exists() {
            println!("  Status: configured");
        } else {
            println!("  Status: not configured (using defaults)");
        }
        println!();
        println!("Application: {}", config.app_name);
        println!("  Bundle: {}", config.bundle_path.display());
        println!("  Process: {}", config.process_name);
        println!("  Work root: {}", config.work_root().display());
        println!("  Backup root: {}", config.backup_root().display());

        println!();
        println!("Targets:");
        for target in &config.targets {
            println!("  {}", target.display());
        }

        println!();
        println!("Signed components:");
        for component in &config.components {
            println!("  {}", component.display());
        }

        println!();
        println!("Patch rule:");
        println!("  marker: {:?}", config.patch.marker);
        println!("  anchor: {:?}", config.patch.anchor);
        println!("  needle: {:?}", config.patch.needle);
        println!("  fragment: {:?}", config.patch.fragment);

        println!();
        println!(
            "Signing retry: {} attempts, {} apart",
            config.retry.max_attempts,
            humantime::format_duration(config.retry.delay)
        );

        Ok(())
    }
}

// ============================================================================
// Init Command
// ============================================================================

/// Create a configuration file with the default layout
#[derive(Args, Debug)]
pub struct InitCmd {
    /// Application name used to derive the bundle and helper paths.
    #[arg(long)]
    pub app_name: Option<String>,

    /// Installed bundle path (default: /Applications/<app name>.app).
    #[arg(long)]
    pub bundle: Option<PathBuf>,

    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,
}

impl InitCmd {
    pub fn run(self, path: &Path) -> Result<()> {
        if path.exists() && !self.force {
            eprintln!("Configuration file already exists at {}", path.display());
            eprintln!("Use --force to overwrite it.");
            return Ok(());
        }

        let mut config = match &self.app_name {
            Some(name) => PatchConfig::for_app(name),
            None => PatchConfig::default(),
        };
        if let Some(bundle) = self.bundle {
            config.bundle_path = bundle;
        }
        config
            .validate()
            .map_err(|e| Error::ConfigSave(e.to_string()))?;

        config.save_to(path)?;
        println!("Created configuration at {}", path.display());
        println!();
        println!("Edit the file to match the installed application's layout.");

        Ok(())
    }
}
