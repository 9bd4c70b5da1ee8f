//! `afpack compress` / `afpack decompress`: toggle transparent compression
//! of a packed path's content.

use std::process::ExitCode;

use afpack_common::CompressionAlgorithm;
use anyhow::Result;
use clap::Args;

use crate::app::AppContext;
use crate::application::services::orchestrator::CompressOutcome;
use crate::commands::PathArgs;
use crate::output::JsonRenderer;

/// Arguments for the compress command.
#[derive(Args)]
pub struct CompressArgs {
    /// Packed directory to compress
    pub path: std::path::PathBuf,

    /// Compression algorithm (default: compression.algorithm from config)
    #[arg(long, value_enum)]
    pub algorithm: Option<CompressionAlgorithm>,
}

/// Run `afpack compress`.
///
/// # Errors
///
/// Returns the orchestrator's failure, carrying a `FailureReport`.
pub async fn run_compress(app: &AppContext, args: CompressArgs) -> Result<ExitCode> {
    let orchestrator = app.orchestrator()?;
    let reporter = app.reporter();
    let outcome = orchestrator
        .compress(&args.path, args.algorithm, &reporter)
        .await?;
    drop(reporter);
    render(app, &outcome)
}

/// Run `afpack decompress`.
///
/// # Errors
///
/// Returns the orchestrator's failure, carrying a `FailureReport`.
pub async fn run_decompress(app: &AppContext, args: PathArgs) -> Result<ExitCode> {
    let orchestrator = app.orchestrator()?;
    let reporter = app.reporter();
    let outcome = orchestrator.decompress(&args.path, &reporter).await?;
    drop(reporter);
    render(app, &outcome)
}

fn render(app: &AppContext, outcome: &CompressOutcome) -> Result<ExitCode> {
    let (path, kind, result, resumed) = match outcome {
        CompressOutcome::Done {
            path,
            kind,
            resumed,
        } => (path, kind, "done", *resumed),
        CompressOutcome::AlreadyDone { path, kind } => (path, kind, "already_done", false),
    };
    if app.is_json() {
        JsonRenderer::render(&serde_json::json!({
            "path": path,
            "operation": kind,
            "result": result,
            "resumed": resumed,
        }))?;
    } else if result == "already_done" {
        app.output
            .info(&format!("{} needs no {kind}ion", path.display()));
    } else {
        app.output
            .success(&format!("{} {kind}ed", path.display()));
    }
    Ok(ExitCode::SUCCESS)
}
