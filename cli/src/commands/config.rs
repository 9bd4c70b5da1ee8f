//! `afpack config`: show and set configuration values.

use std::process::ExitCode;

use anyhow::Result;
use clap::Subcommand;

use crate::app::AppContext;
use crate::application::ports::ConfigStore;
use crate::application::services::config_service;
use crate::output::{JsonRenderer, Renderer};

/// Config subcommands.
#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show,
    /// Set configuration value
    Set {
        /// Configuration key
        key: String,
        /// Configuration value
        value: String,
    },
}

/// Run the config command.
///
/// # Errors
///
/// Returns an error for unknown keys, invalid values, or an unreadable file.
pub fn run(app: &AppContext, cmd: ConfigCommand) -> Result<ExitCode> {
    match cmd {
        ConfigCommand::Show => show_config(app),
        ConfigCommand::Set { key, value } => set_config(app, &key, &value),
    }
}

fn show_config(app: &AppContext) -> Result<ExitCode> {
    let config = config_service::load_config(&app.config_store)?;
    let path = app.config_store.path()?;
    match app.renderer() {
        Renderer::Json(_) => JsonRenderer::render(&config)?,
        Renderer::Human(human) => human.render_config(&path, &config.entries()),
    }
    Ok(ExitCode::SUCCESS)
}

fn set_config(app: &AppContext, key: &str, value: &str) -> Result<ExitCode> {
    config_service::set_value(&app.config_store, key, value)?;
    let shown = config_service::get_value(&app.config_store, key)?;
    if app.is_json() {
        JsonRenderer::render(&serde_json::json!({ "key": key, "value": shown }))?;
    } else {
        app.output.success(&format!("Set {key} = {shown}"));
    }
    Ok(ExitCode::SUCCESS)
}
