//! bundlepatch - patch and ad-hoc re-sign an installed application bundle.
//!
//! The entry point is [`PatchService`], which inserts a fragment into the
//! bundle's target scripts on a staged copy, re-signs the copy and swaps it
//! into place. Runs on an already-patched bundle are no-ops.

pub mod bundle;
pub mod config;
pub mod error;
pub mod patch;
pub mod process;
pub mod retry;
pub mod service;

pub use config::PatchConfig;
pub use error::{Error, Result};
pub use service::{inspect_bundle, PatchReport, PatchService};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
