//! CLI argument parsing with clap derive

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::app::{AppContext, AppFlags, BehaviourFlags, OutputFlags, STATE_DIR_ENV};
use crate::application::ports::CancelFlag;
use crate::commands;

/// Move dependency folders into transparently mounted disk images
#[derive(Parser)]
#[command(
    name = "afpack",
    version,
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR", value_parser = clap::builder::FalseyValueParser::new())]
    pub no_color: bool,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// State directory holding the ledger and locks
    #[arg(long, global = true, env = STATE_DIR_ENV)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Move directories into mounted disk images
    Pack(commands::pack::PackArgs),

    /// Restore a packed directory and delete its image
    Unpack(commands::PathArgs),

    /// Show the state of a managed directory
    Status(commands::PathArgs),

    /// Compress the content of a packed directory
    Compress(commands::compress::CompressArgs),

    /// Remove compression from a packed directory
    Decompress(commands::PathArgs),

    /// Re-attach the image of a packed directory
    Mount(commands::PathArgs),

    /// List managed directories
    List,

    /// Show the operation log of a managed directory
    Log(commands::PathArgs),

    /// Roll back an interrupted operation
    Recover(commands::recover::RecoverArgs),

    /// Manage configuration
    #[command(subcommand)]
    Config(commands::config::ConfigCommand),
}

impl Cli {
    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn run(self, cancel: CancelFlag) -> Result<ExitCode> {
        let Cli {
            json,
            quiet,
            no_color,
            verbose: _,
            state_dir,
            command,
        } = self;
        let yes = matches!(&command, Command::Recover(args) if args.yes);
        let app = AppContext::new(
            &AppFlags {
                output: OutputFlags {
                    no_color,
                    quiet,
                    json,
                },
                behaviour: BehaviourFlags { yes, state_dir },
            },
            cancel,
        );

        match command {
            Command::Pack(args) => commands::pack::run(&app, args).await,
            Command::Unpack(args) => commands::unpack::run(&app, args).await,
            Command::Status(args) => commands::status::run(&app, args).await,
            Command::Compress(args) => commands::compress::run_compress(&app, args).await,
            Command::Decompress(args) => commands::compress::run_decompress(&app, args).await,
            Command::Mount(args) => commands::mount::run(&app, args).await,
            Command::List => commands::list::run(&app).await,
            Command::Log(args) => commands::log::run(&app, args).await,
            Command::Recover(args) => commands::recover::run(&app, args).await,
            Command::Config(cmd) => commands::config::run(&app, cmd),
        }
    }
}

/// Default log filter for a `-v` count; `RUST_LOG` overrides it.
#[must_use]
pub fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}
