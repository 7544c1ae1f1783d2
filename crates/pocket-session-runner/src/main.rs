/*
[INPUT]:  CLI arguments, YAML configuration file, SSID environment, OS shutdown signals
[OUTPUT]: A monitored venue session with graceful shutdown
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pocket_session::SessionClient;
use pocket_session_runner::{RunnerConfig, monitor};

#[derive(Parser, Debug)]
#[command(name = "pocket-session-runner", version, about = "Persistent venue session runner")]
struct Cli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: PathBuf,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long = "dry-run")]
    dry_run: bool,
    /// Raw auth frame; overrides `ssid` in the config file
    #[arg(long = "ssid", env = "POCKET_OPTION_SSID", hide_env_values = true)]
    ssid: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(&args.log_level)?;

    info!(
        config_path = %args.config_path.display(),
        dry_run = args.dry_run,
        "starting pocket-session-runner"
    );

    let config = load_config(&args.config_path)?;
    let credentials = config.credentials(args.ssid.as_deref())?;
    let is_demo = config.is_demo(&credentials);
    let session_config = config.session_config(is_demo)?;
    let stats_interval = config.stats_interval()?;
    info!(
        endpoints = session_config.endpoints.len(),
        demo = is_demo,
        watch = config.watch.len(),
        symbols = config.symbols.len(),
        "configuration loaded"
    );

    if args.dry_run {
        info!("dry-run requested; configuration validated");
        return Ok(());
    }

    let client = Arc::new(SessionClient::new(session_config, credentials).context("create session")?);
    monitor::watch_tags(&client, &config.watch);

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let monitor_task = tokio::spawn(monitor::run(
        Arc::clone(&client),
        config.symbols.clone(),
        stats_interval,
        shutdown.clone(),
    ));

    info!("connecting");
    let connected = tokio::select! {
        _ = shutdown.cancelled() => None,
        result = client.connect() => Some(result),
    };
    let outcome = match connected {
        Some(Ok(())) => {
            info!("session established");
            shutdown.cancelled().await;
            info!("shutdown signal received");
            Ok(())
        }
        Some(Err(err)) => {
            warn!(error = %err, "connect failed");
            shutdown.cancel();
            Err(err)
        }
        None => {
            info!("shutdown signal received while connecting");
            Ok(())
        }
    };

    client.disconnect().await;
    monitor_task.await.context("join monitor")?;
    info!("session closed");

    outcome.context("connect session")
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(())
}

fn load_config(path: &PathBuf) -> Result<RunnerConfig> {
    let path_str = path
        .to_str()
        .context("config path must be valid utf-8")?;
    RunnerConfig::from_file(path_str).context("load config")
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown_clone.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
