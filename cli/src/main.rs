//! afpack CLI - move dependency folders into transparently mounted disk images

use std::process::ExitCode;

use afpack_cli::application::ports::CancelFlag;
use afpack_cli::cli::{Cli, log_filter};
use afpack_cli::domain::error::exit_code_for;
use afpack_cli::output::json;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let json_mode = cli.json;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_filter(cli.verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cancel = CancelFlag::new();
    spawn_signal_handler(cancel.clone());

    match cli.run(cancel).await {
        Ok(code) => code,
        Err(err) => {
            if json_mode {
                match json::format_error(&err) {
                    Ok(doc) => println!("{doc}"),
                    Err(_) => eprintln!("Error: {err:#}"),
                }
            } else {
                eprintln!("Error: {err}");
                for cause in err.chain().skip(1) {
                    eprintln!("  caused by: {cause}");
                }
            }
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// Set `cancel` on SIGINT/SIGTERM. Running loops stop at the next batch
/// boundary and checkpoint; a second signal exits immediately.
fn spawn_signal_handler(cancel: CancelFlag) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::warn!("interrupt received; stopping at the next checkpoint");
        cancel.cancel();
        wait_for_signal().await;
        std::process::exit(130);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
