//! `afpack pack [PATH]... [--compress ALGO] [--dry-run]`: move directories
//! into mounted images.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use afpack_common::CompressionAlgorithm;
use anyhow::{Context, Result};
use clap::Args;

use crate::app::AppContext;
use crate::application::services::orchestrator::{PackOptions, PackOutcome};
use crate::domain::error::exit_code_for;
use crate::domain::layout::{ARTIFACT_DIRS, IMAGE_EXTENSION};
use crate::output::{JsonRenderer, Renderer, json};

/// Arguments for the pack command.
#[derive(Args)]
pub struct PackArgs {
    /// Directories to pack (default: known artifact directories in the
    /// current directory)
    pub paths: Vec<PathBuf>,

    /// Compress the image content after packing
    #[arg(long, value_enum)]
    pub compress: Option<CompressionAlgorithm>,

    /// Show what would be done without touching disk
    #[arg(long)]
    pub dry_run: bool,
}

/// Run `afpack pack`.
///
/// # Errors
///
/// With a single path the failure is returned as is; with several paths
/// every failure is printed and the first one's exit code is returned.
pub async fn run(app: &AppContext, args: PackArgs) -> Result<ExitCode> {
    let paths = if args.paths.is_empty() {
        let cwd = std::env::current_dir().context("cannot determine current directory")?;
        let found = detect_artifact_dirs(&cwd);
        if found.is_empty() {
            anyhow::bail!(
                "no artifact directory found in {} (looked for {})",
                cwd.display(),
                ARTIFACT_DIRS.join(", ")
            );
        }
        found
    } else {
        args.paths
    };

    let orchestrator = app.orchestrator()?;
    let opts = PackOptions {
        compress: args.compress,
        dry_run: args.dry_run,
    };
    let reporter = app.reporter();

    if let [path] = paths.as_slice() {
        let outcome = orchestrator.pack(path, &opts, &reporter).await?;
        render(app, &outcome)?;
        return Ok(ExitCode::SUCCESS);
    }

    let results = orchestrator.pack_many(&paths, &opts, &reporter).await;
    drop(reporter);
    let mut exit = ExitCode::SUCCESS;
    let mut failed = false;
    let mut documents = Vec::new();
    for (path, result) in results {
        match result {
            Ok(outcome) => {
                if app.is_json() {
                    documents.push(json::pack_value(&outcome));
                } else {
                    render(app, &outcome)?;
                }
            }
            Err(err) => {
                if !failed {
                    exit = ExitCode::from(exit_code_for(&err));
                    failed = true;
                }
                if app.is_json() {
                    documents.push(json::error_value(&err));
                } else {
                    app.output
                        .error(&format!("{}: {err:#}", path.display()));
                }
            }
        }
    }
    if app.is_json() {
        JsonRenderer::render(&documents)?;
    }
    Ok(exit)
}

/// Existing artifact directories directly under `root`, in list order.
#[must_use]
pub fn detect_artifact_dirs(root: &Path) -> Vec<PathBuf> {
    ARTIFACT_DIRS
        .iter()
        .filter(|name| {
            std::fs::symlink_metadata(root.join(name)).is_ok_and(|m| m.file_type().is_dir())
                || root.join(format!("{name}.{IMAGE_EXTENSION}")).exists()
        })
        .map(|name| root.join(name))
        .collect()
}

fn render(app: &AppContext, outcome: &PackOutcome) -> Result<()> {
    match app.renderer() {
        Renderer::Json(_) => JsonRenderer::render(&json::pack_value(outcome)),
        Renderer::Human(human) => {
            human.render_pack(outcome);
            Ok(())
        }
    }
}
