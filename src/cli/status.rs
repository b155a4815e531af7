//! Status command implementation.

use bundlepatch::bundle;
use bundlepatch::config::PatchConfig;
use bundlepatch::{inspect_bundle, Error};
use clap::Args;
use std::path::PathBuf;

/// Show the patch state of each target without changing anything.
#[derive(Args, Debug)]
pub struct StatusCmd {
    /// Bundle to inspect (default: bundle_path from the config).
    #[arg(long)]
    pub bundle: Option<PathBuf>,

    /// Also print a SHA-256 digest of the whole bundle tree.
    #[arg(long)]
    pub tree_digest: bool,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusCmd {
    /// Execute the status command.
    pub fn run(&self, config: &PatchConfig) -> bundlepatch::Result<()> {
        let bundle_path = self
            .bundle
            .clone()
            .unwrap_or_else(|| config.bundle_path.clone());

        let targets = inspect_bundle(config, &bundle_path)?;
        let digest = if self.tree_digest {
            Some(bundle::tree_digest(&bundle_path).map_err(|e| Error::read(&bundle_path, e))?)
        } else {
            None
        };

        if self.json {
            let json = serde_json::json!({
                "bundle": bundle_path,
                "tree_digest": digest,
                "targets": targets,
            });
            println!("{}", serde_json::to_string_pretty(&json).unwrap_or_default());
            return Ok(());
        }

        println!("Bundle: {}", bundle_path.display());
        if let Some(digest) = digest {
            println!("Tree digest: {}", digest);
        }
        println!();
        println!("{:<12} {:<18} {:<14} PATH", "STATE", "INSERTION", "SHA256");
        println!("{}", "-".repeat(80));

        for target in &targets {
            let state = if !target.exists {
                "missing"
            } else if target.marker_present {
                "patched"
            } else if target.insertion_point.is_some() {
                "unpatched"
            } else {
                "unpatchable"
            };
            let insertion = target
                .insertion_point
                .map(|o| format!("byte {}", o))
                .unwrap_or_else(|| "-".to_string());
            let sha = target
                .sha256
                .as_deref()
                .map(|s| &s[..12.min(s.len())])
                .unwrap_or("-");

            println!(
                "{:<12} {:<18} {:<14} {}",
                state,
                insertion,
                sha,
                target.path.display()
            );
            if let Some(reason) = &target.skip_reason {
                println!("  {}", reason);
            }
        }

        Ok(())
    }
}
