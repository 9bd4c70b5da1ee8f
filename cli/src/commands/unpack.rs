//! `afpack unpack <PATH>`: restore a packed directory and delete its image.

use std::process::ExitCode;

use anyhow::Result;

use crate::app::AppContext;
use crate::commands::PathArgs;
use crate::output::JsonRenderer;

/// Run `afpack unpack`.
///
/// # Errors
///
/// Returns the orchestrator's failure, carrying a `FailureReport`.
pub async fn run(app: &AppContext, args: PathArgs) -> Result<ExitCode> {
    let orchestrator = app.orchestrator()?;
    let reporter = app.reporter();
    let outcome = orchestrator.unpack(&args.path, &reporter).await?;
    drop(reporter);

    if app.is_json() {
        JsonRenderer::render(&serde_json::json!({
            "path": outcome.path,
            "result": "unpacked",
            "resumed": outcome.resumed,
        }))?;
    } else {
        let verb = if outcome.resumed {
            "Resumed and unpacked"
        } else {
            "Unpacked"
        };
        app.output
            .success(&format!("{verb} {}", outcome.path.display()));
    }
    Ok(ExitCode::SUCCESS)
}
