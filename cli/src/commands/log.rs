//! `afpack log <PATH>`: the operation log of a managed path.

use std::process::ExitCode;

use anyhow::Result;

use crate::app::AppContext;
use crate::commands::PathArgs;
use crate::output::{JsonRenderer, Renderer};

/// Run `afpack log`.
///
/// # Errors
///
/// Returns `NotManaged` for unknown paths.
pub async fn run(app: &AppContext, args: PathArgs) -> Result<ExitCode> {
    let orchestrator = app.orchestrator()?;
    let records = orchestrator.log(&args.path).await?;
    match app.renderer() {
        Renderer::Json(_) => JsonRenderer::render(&records)?,
        Renderer::Human(human) => human.render_log(&records),
    }
    Ok(ExitCode::SUCCESS)
}
