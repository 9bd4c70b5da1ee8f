//! Command implementations

pub mod compress;
pub mod config;
pub mod list;
pub mod log;
pub mod mount;
pub mod pack;
pub mod recover;
pub mod status;
pub mod unpack;

use std::path::PathBuf;

use clap::Args;

/// A single managed path argument.
#[derive(Args)]
pub struct PathArgs {
    /// Directory to operate on
    pub path: PathBuf,
}
