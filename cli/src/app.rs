//! Application context: unified state passed to every command handler.
//!
//! `AppContext` resolves the global flags, the config file and the state
//! directory once, and builds the production orchestrator on demand so that
//! `config` subcommands work without touching the state directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::application::ports::{CancelFlag, ConfigStore};
use crate::application::services::orchestrator::{Backends, Orchestrator};
use crate::domain::config::Settings;
use crate::infra::applesauce::ApplesauceBackend;
use crate::infra::command_runner::{DEFAULT_CMD_TIMEOUT, IMAGE_CMD_TIMEOUT, TokioCommandRunner};
use crate::infra::config::YamlConfigStore;
use crate::infra::diskutil::DiskutilBackend;
use crate::infra::ledger::FileLedger;
use crate::infra::lock::FileLocker;
use crate::infra::platform::MacosProbe;
use crate::infra::tree::LocalTree;
use crate::output::{HumanRenderer, JsonRenderer, OutputContext, Renderer, TerminalReporter};

/// Environment variable overriding the state directory.
pub const STATE_DIR_ENV: &str = "AFPACK_STATE_DIR";

/// The orchestrator wired to the macOS tools and on-disk state.
pub type ProductionOrchestrator = Orchestrator<
    DiskutilBackend<TokioCommandRunner>,
    ApplesauceBackend,
    MacosProbe<TokioCommandRunner>,
    FileLedger,
    FileLocker,
    FileLocker,
    LocalTree,
>;

/// Output rendering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-readable terminal output (default).
    Human,
    /// Machine-readable JSON output.
    Json,
}

/// Output rendering flags.
pub struct OutputFlags {
    /// Disable ANSI color output.
    pub no_color: bool,
    /// Suppress non-error output.
    pub quiet: bool,
    /// Enable JSON output mode.
    pub json: bool,
}

/// Behaviour flags.
pub struct BehaviourFlags {
    /// Skip interactive prompts (also set by `CI` / `AFPACK_YES` env vars).
    pub yes: bool,
    /// Explicit state directory (`--state-dir` / `AFPACK_STATE_DIR`).
    pub state_dir: Option<PathBuf>,
}

/// Flags passed from the top-level CLI to `AppContext::new`.
pub struct AppFlags {
    /// Output rendering options.
    pub output: OutputFlags,
    /// Behaviour options.
    pub behaviour: BehaviourFlags,
}

/// Unified application context passed to every command handler.
pub struct AppContext {
    /// Terminal output context. Quiet in JSON mode so stdout stays parseable.
    pub output: OutputContext,
    /// Output rendering mode (human vs JSON).
    pub mode: OutputMode,
    /// Config file access.
    pub config_store: YamlConfigStore,
    /// Set by the signal handler; polled between batches.
    pub cancel: CancelFlag,
    /// When `true`, skip interactive prompts and use defaults.
    pub non_interactive: bool,
    state_dir: Option<PathBuf>,
}

impl AppContext {
    /// Construct an `AppContext` from top-level CLI flags.
    #[must_use]
    pub fn new(flags: &AppFlags, cancel: CancelFlag) -> Self {
        let ci_env = std::env::var("CI").is_ok() || std::env::var("AFPACK_YES").is_ok();
        let mode = if flags.output.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        };
        Self {
            output: OutputContext::new(
                flags.output.no_color,
                flags.output.quiet || flags.output.json,
            ),
            mode,
            config_store: YamlConfigStore,
            cancel,
            non_interactive: flags.behaviour.yes || ci_env,
            state_dir: flags.behaviour.state_dir.clone(),
        }
    }

    /// Returns `true` when JSON output mode is active.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.mode == OutputMode::Json
    }

    /// Returns the appropriate `Renderer` variant for the current output mode.
    #[must_use]
    pub fn renderer(&self) -> Renderer<'_> {
        match self.mode {
            OutputMode::Human => Renderer::Human(HumanRenderer::new(&self.output)),
            OutputMode::Json => Renderer::Json(JsonRenderer),
        }
    }

    /// Progress reporter for state-changing commands.
    #[must_use]
    pub fn reporter(&self) -> TerminalReporter<'_> {
        TerminalReporter::new(&self.output)
    }

    /// Resolve the effective settings: flag/env state dir, then the config
    /// file, then `~/.afpack`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file is invalid or no home directory
    /// can be found.
    pub fn settings(&self) -> Result<Settings> {
        let config = self.config_store.load()?;
        let state_dir = match (&self.state_dir, &config.state_dir) {
            (Some(dir), _) => dir.clone(),
            (None, Some(dir)) => expand_home(dir)?,
            (None, None) => dirs::home_dir()
                .context("cannot determine home directory")?
                .join(".afpack"),
        };
        Settings::from_config(&config, state_dir)
    }

    /// Build the production orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings cannot be resolved.
    pub fn orchestrator(&self) -> Result<ProductionOrchestrator> {
        let settings = self.settings()?;
        tracing::debug!(state_dir = %settings.state_dir.display(), "state directory");
        let backends = Backends {
            image: DiskutilBackend::new(TokioCommandRunner::new(IMAGE_CMD_TIMEOUT)),
            compression: ApplesauceBackend::new(),
            probe: MacosProbe::new(TokioCommandRunner::new(DEFAULT_CMD_TIMEOUT)),
            ledger: FileLedger::new(&settings.state_dir),
            locker: FileLocker::new(&settings.state_dir),
            gate: FileLocker::new(&settings.state_dir),
            tree: LocalTree,
        };
        Ok(Orchestrator::new(backends, settings, self.cancel.clone()))
    }

    /// Ask the user for confirmation.
    ///
    /// When `non_interactive` is `true` (CI, `--yes` flag, or `AFPACK_YES`
    /// env), returns `default` immediately without prompting.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal prompt fails (e.g. no TTY available).
    pub fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        if self.non_interactive {
            return Ok(default);
        }
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(default)
            .interact()?;
        Ok(confirmed)
    }
}

/// Expand a leading `~` in a configured path.
fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => Ok(dirs::home_dir()
            .context("cannot determine home directory")?
            .join(rest)),
        Err(_) => Ok(path.to_path_buf()),
    }
}
