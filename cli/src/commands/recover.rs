//! `afpack recover <PATH> [--yes]`: resolve an interrupted operation
//! without retrying it.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Args;

use crate::app::AppContext;
use crate::application::services::orchestrator::RecoverOutcome;
use crate::output::JsonRenderer;

/// Arguments for the recover command.
#[derive(Args)]
pub struct RecoverArgs {
    /// Managed directory with an interrupted operation
    pub path: PathBuf,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

/// Run `afpack recover`.
///
/// # Errors
///
/// Returns `NotManaged`, `Busy`, or the failure of the rollback itself.
pub async fn run(app: &AppContext, args: RecoverArgs) -> Result<ExitCode> {
    let orchestrator = app.orchestrator()?;
    let status = orchestrator.status(&args.path).await?;
    let Some(pending) = status.pending.as_ref() else {
        if app.is_json() {
            JsonRenderer::render(&serde_json::json!({
                "path": status.path,
                "result": "nothing_to_do",
                "state": status.state.label(),
            }))?;
        } else {
            app.output.info(&format!(
                "{} has no interrupted operation ({})",
                status.path.display(),
                status.state
            ));
        }
        return Ok(ExitCode::SUCCESS);
    };

    if !args.yes
        && !app.confirm(
            &format!(
                "Abandon the interrupted {} of {} (stopped at {})?",
                pending.kind,
                status.path.display(),
                pending.step
            ),
            false,
        )?
    {
        app.output.info("Cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let reporter = app.reporter();
    let outcome = orchestrator.recover(&args.path, &reporter).await?;
    drop(reporter);

    let (path, state, result) = match &outcome {
        RecoverOutcome::RolledBack { path, state } => (path, state, "rolled_back"),
        RecoverOutcome::RolledForward { path, state } => (path, state, "rolled_forward"),
        RecoverOutcome::NothingToDo { path, state } => (path, state, "nothing_to_do"),
    };
    if app.is_json() {
        JsonRenderer::render(&serde_json::json!({
            "path": path,
            "result": result,
            "state": state.label(),
        }))?;
    } else {
        let how = match &outcome {
            RecoverOutcome::RolledBack { .. } => "rolled back",
            RecoverOutcome::RolledForward { .. } => "completed",
            RecoverOutcome::NothingToDo { .. } => "left as is",
        };
        app.output
            .success(&format!("{} {how}; now {state}", path.display()));
    }
    Ok(ExitCode::SUCCESS)
}
