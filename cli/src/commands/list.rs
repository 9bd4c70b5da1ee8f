//! `afpack list`: every managed path.

use std::process::ExitCode;

use anyhow::Result;

use crate::app::AppContext;
use crate::output::{JsonRenderer, Renderer};

/// Run `afpack list`.
///
/// # Errors
///
/// Returns an error if a ledger entry cannot be read.
pub async fn run(app: &AppContext) -> Result<ExitCode> {
    let orchestrator = app.orchestrator()?;
    let entries = orchestrator.list().await?;
    match app.renderer() {
        Renderer::Json(_) => JsonRenderer::render(&entries)?,
        Renderer::Human(human) => human.render_list(&entries),
    }
    Ok(ExitCode::SUCCESS)
}
