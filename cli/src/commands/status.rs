//! `afpack status <PATH>`: show state, size and compression of a managed path.

use std::process::ExitCode;

use anyhow::Result;

use crate::app::AppContext;
use crate::commands::PathArgs;
use crate::output::{JsonRenderer, Renderer};

/// Run `afpack status`.
///
/// # Errors
///
/// Returns `NotManaged` for unknown paths and `CorruptLedger` for entries
/// that cannot be read.
pub async fn run(app: &AppContext, args: PathArgs) -> Result<ExitCode> {
    let orchestrator = app.orchestrator()?;
    let status = orchestrator.status(&args.path).await?;
    match app.renderer() {
        Renderer::Json(_) => JsonRenderer::render(&status)?,
        Renderer::Human(human) => human.render_status(&status),
    }
    Ok(ExitCode::SUCCESS)
}
