//! `afpack mount <PATH>`: re-attach the image of a packed path.

use std::process::ExitCode;

use anyhow::Result;

use crate::app::AppContext;
use crate::application::services::orchestrator::MountOutcome;
use crate::commands::PathArgs;
use crate::output::JsonRenderer;

/// Run `afpack mount`.
///
/// # Errors
///
/// Returns `NotManaged`, `InvalidState` unless the path is packed, or a
/// `MountConflict` when something else occupies the path.
pub async fn run(app: &AppContext, args: PathArgs) -> Result<ExitCode> {
    let orchestrator = app.orchestrator()?;
    let outcome = orchestrator.mount(&args.path).await?;
    match (&outcome, app.is_json()) {
        (MountOutcome::Mounted { path, device }, true) => {
            JsonRenderer::render(&serde_json::json!({
                "path": path,
                "result": "mounted",
                "device": device,
            }))?;
        }
        (MountOutcome::AlreadyMounted { path }, true) => {
            JsonRenderer::render(&serde_json::json!({
                "path": path,
                "result": "already_mounted",
            }))?;
        }
        (MountOutcome::Mounted { path, device }, false) => {
            app.output
                .success(&format!("Mounted {} ({device})", path.display()));
        }
        (MountOutcome::AlreadyMounted { path }, false) => {
            app.output
                .info(&format!("{} is already mounted", path.display()));
        }
    }
    Ok(ExitCode::SUCCESS)
}
