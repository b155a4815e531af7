//! Patch command implementation.

use bundlepatch::config::PatchConfig;
use bundlepatch::process;
use bundlepatch::service::{Outcome, PatchReport, TargetStatus};
use bundlepatch::{Error, PatchService};
use bundlepatch_codesign::{Codesign, CODESIGN_PATH};
use clap::Args;
use std::path::PathBuf;

/// Patch the bundle's target scripts and re-sign it.
#[derive(Args, Debug)]
pub struct PatchCmd {
    /// Bundle to patch (default: bundle_path from the config).
    #[arg(long)]
    pub bundle: Option<PathBuf>,

    /// Do not ask for confirmation.
    #[arg(short, long)]
    pub yes: bool,

    /// Skip the check that the application is not running.
    #[arg(long)]
    pub skip_process_check: bool,

    /// Signing tool to invoke.
    #[arg(long, default_value = CODESIGN_PATH)]
    pub codesign: String,

    /// Output the report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl PatchCmd {
    /// Execute the patch command.
    pub fn run(self, config: &PatchConfig) -> bundlepatch::Result<()> {
        let bundle = self
            .bundle
            .clone()
            .unwrap_or_else(|| config.bundle_path.clone());

        if !self.skip_process_check {
            process::ensure_not_running(&config.process_name)?;
        }

        let signer = Codesign::with_program(&self.codesign);
        if !signer.is_available() {
            return Err(Error::command_failed(
                signer.program(),
                "signing tool not found",
            ));
        }

        // Confirm unless --yes
        if !self.yes && !self.json {
            eprint!("Patch and re-sign {}? [y/N] ", bundle.display());
            let mut input = String::new();
            if std::io::stdin().read_line(&mut input).is_err()
                || !matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
            {
                println!("Cancelled");
                return Ok(());
            }
        }

        let service = PatchService::new(config, signer);
        let report = match service.patch_bundle(&bundle) {
            Ok(report) => report,
            Err(e) => {
                if let Error::SigningFailed { remediation, .. } = &e {
                    eprintln!("Signing could not be verified. To finish by hand, run:");
                    for command in remediation {
                        eprintln!("  {}", command);
                    }
                }
                return Err(e);
            }
        };

        if self.json {
            let json = serde_json::to_string_pretty(&report)
                .map_err(|e| Error::config(format!("failed to encode report: {}", e)))?;
            println!("{}", json);
        } else {
            print_report(&report);
        }

        Ok(())
    }
}

fn print_report(report: &PatchReport) {
    match report.outcome {
        Outcome::AlreadyPatched => {
            println!("Already patched: {}", report.bundle.display());
            return;
        }
        Outcome::Patched => println!(
            "Patched {} of {} targets in {}",
            report.patched_count(),
            report.targets.len(),
            report.bundle.display()
        ),
    }

    for target in &report.targets {
        let status = match &target.status {
            TargetStatus::AlreadyPatched => "already patched".to_string(),
            TargetStatus::Patched { offset } => format!("patched at byte {}", offset),
            TargetStatus::Skipped { reason } => format!("skipped ({})", reason),
        };
        println!("  {}: {}", target.path.display(), status);
    }

    println!(
        "Signed and verified after {} attempt(s)",
        report.signing_attempts.len()
    );

    if !report.warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in &report.warnings {
            println!("  {}", warning);
        }
    }
}
