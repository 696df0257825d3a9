mod checks;
mod config;
mod control;
mod notify;
mod probe;
mod scheduler;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use checks::CheckRunner;
use checks::runner::resolve_host_port;
use config::Config;
use control::{Auth, ControlConnection};

#[derive(Parser)]
#[command(name = "weather-service", version, about = "Relay health monitor and notifier")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitoring daemon.
    Run,
    /// Run a single check cycle, then exit.
    Once,
    /// Probe-worker process entry point (spawned internally, one per
    /// circuit).
    #[command(hide = true)]
    ProbeWorker,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logger::init_tracing();

    // Workers speak JSON on stdout and read their spec from stdin; they
    // never touch the config file or the store.
    if let Command::ProbeWorker = cli.command {
        return probe::worker::worker_main().await;
    }

    let config = Config::from_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run => {
            let runner = build_runner(&config).await?;
            let period = Duration::from_secs(config.updater.interval_secs);
            scheduler::run_forever(runner, period).await;
            Ok(())
        }
        Command::Once => {
            let mut runner = build_runner(&config).await?;
            runner.run_cycle().await
        }
        Command::ProbeWorker => unreachable!("handled above"),
    }
}

async fn build_runner(config: &Config) -> anyhow::Result<CheckRunner> {
    let store = store::open(&config.store.path).await.context("opening the subscription store")?;

    let auth = if let Some(password) = &config.control.password {
        Auth::Password(password.clone())
    } else if let Some(cookie_file) = &config.control.cookie_file {
        Auth::CookieFile(cookie_file.clone())
    } else {
        Auth::None
    };

    let control_addr = resolve_host_port(&config.control.host, config.control.port)
        .context("resolving the control port address")?;
    let (ctl, events) = ControlConnection::connect(control_addr, &auth, 256)
        .await
        .context("connecting to the control port")?;
    tracing::info!("connected to control port at {control_addr}");

    let notifier = notify::notifier_from_config(&config.notify)?;

    CheckRunner::new(Arc::new(store), ctl, events, notifier, config.clone()).await
}
