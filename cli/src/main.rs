//! tether CLI - drives a supervised worker from the command line.
//!
//! ```text
//! tether [--config PATH] [--workspace PATH] request <method> [json-params]
//!                                           notify <method> [json-params]
//!                                           refresh
//! ```
//!
//! The worker is started on demand by the first request and shut down
//! before the process exits.
//!
//! The daemon watcher is not driven from here: `PassiveWatcherSupervisor`
//! needs a `DaemonClient`, which the embedding application provides.

use std::env;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use tether_supervisor::config::config_dir;
use tether_supervisor::{
    ProcessLauncher, ProgressReporter, SupervisorConfig, WorkerLauncher, WorkerSupervisor,
};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => warnings.push(format!(
                "Failed to open log file {}: {e}",
                candidate.display()
            )),
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.tether/logs/tether.log
    if let Some(dir) = config_dir() {
        candidates.push(dir.join("logs").join("tether.log"));
    }

    // Fallback: ./.tether/logs/tether.log
    candidates.push(PathBuf::from(".tether").join("logs").join("tether.log"));

    candidates
}

#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Drive a supervised worker from the command line")]
struct Cli {
    /// Config file to read instead of ~/.tether/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Workspace root; defaults to [worker].workspace_path, then the current directory
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Send a request and print the result
    Request {
        method: String,
        /// JSON params
        #[arg(value_parser = parse_params)]
        params: Option<Value>,
    },
    /// Send a notification
    Notify {
        method: String,
        /// JSON params
        #[arg(value_parser = parse_params)]
        params: Option<Value>,
    },
    /// Restart the worker and wait for a workspace refresh
    Refresh,
}

fn parse_params(raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("params are not JSON: {e}"))
}

/// Prints refresh progress to stderr.
#[derive(Default)]
struct StderrProgress {
    percent: AtomicU32,
}

impl ProgressReporter for StderrProgress {
    fn report(&self, message: Option<&str>, increment: Option<u32>) {
        let percent = self.percent.fetch_add(increment.unwrap_or(0), Ordering::SeqCst)
            + increment.unwrap_or(0);
        match message {
            Some(message) => eprintln!("[{percent:>3}%] {message}"),
            None => eprintln!("[{percent:>3}%]"),
        }
    }
}

async fn run(supervisor: &WorkerSupervisor, command: Command) -> Result<()> {
    match command {
        Command::Request { method, params } => {
            match supervisor.send_request_raw(&method, params).await {
                Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                None => println!("no result"),
            }
        }
        Command::Notify { method, params } => {
            supervisor.send_notification_raw(&method, params).await?;
        }
        Command::Refresh => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_interrupt.cancel();
                }
            });

            supervisor
                .refresh_workspace(&StderrProgress::default(), cancel.clone())
                .await?;
            if cancel.is_cancelled() {
                eprintln!("Stopped waiting for the refresh");
            } else {
                eprintln!("Workspace refreshed");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    init_tracing();

    let config = match &args.config {
        Some(path) => SupervisorConfig::load_from(path)?,
        None => SupervisorConfig::load()?.unwrap_or_default(),
    };

    let launcher = ProcessLauncher::from_config(&config.worker)
        .context("no worker command configured; set [worker].command in ~/.tether/config.toml")?;
    let launcher: Arc<dyn WorkerLauncher> = Arc::new(launcher);
    let supervisor = WorkerSupervisor::new(launcher, config.worker.options());

    let workspace = match args.workspace.or_else(|| config.worker.workspace_path()) {
        Some(path) => path,
        None => env::current_dir().context("resolving the current directory")?,
    };
    supervisor.set_workspace_path(workspace);

    let outcome = run(&supervisor, args.command).await;
    supervisor.shutdown().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("tether").chain(args.iter().copied()))
    }

    #[test]
    fn parses_request_with_params() {
        let args = parse(&["--workspace", "/repo", "request", "workspace/graph", r#"{"deep":true}"#])
            .unwrap();
        assert_eq!(args.workspace, Some(PathBuf::from("/repo")));
        assert_eq!(args.config, None);
        assert_eq!(
            args.command,
            Command::Request {
                method: "workspace/graph".into(),
                params: Some(serde_json::json!({"deep": true})),
            }
        );
    }

    #[test]
    fn parses_notify_and_refresh() {
        let args = parse(&["notify", "workspace/change", "--config", "/etc/tether.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/tether.toml")));
        assert_eq!(
            args.command,
            Command::Notify {
                method: "workspace/change".into(),
                params: None,
            }
        );

        assert_eq!(parse(&["refresh"]).unwrap().command, Command::Refresh);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["request"]).is_err());
        assert!(parse(&["request", "m", "{not json"]).is_err());
        assert!(parse(&["request", "m", "1", "2"]).is_err());
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["--verbose", "refresh"]).is_err());
        assert!(parse(&["explode"]).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn progress_accumulates() {
        let progress = StderrProgress::default();
        progress.report(Some("Stopping daemon"), Some(10));
        progress.report(None, Some(30));
        progress.report(Some("no increment"), None);
        assert_eq!(progress.percent.load(Ordering::SeqCst), 40);
    }
}
