mod app;
mod config;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use app::App;
use config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "trialkit", version, about = "Trial sequencer with recording handshake")]
struct Cli {
    /// YAML task file; built-in defaults when omitted.
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    /// Overrides `recording.data_dir`.
    #[arg(long = "data-dir", value_name = "DIR")]
    data_dir: Option<PathBuf>,
    /// Seeds trial order and inter-trial intervals.
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(&args.log_level)?;

    let mut config = match &args.config_path {
        Some(path) => AppConfig::from_file(path).context("load config")?,
        None => AppConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.recording.data_dir = dir;
    }
    info!(
        task = ?config.task,
        data_dir = %config.recording.data_dir.display(),
        seed = ?args.seed,
        "starting trialkit"
    );

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    App::new(config, args.seed)
        .run(shutdown)
        .await
        .context("run operator console")?;
    info!("shutdown complete");
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(())
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let on_interrupt = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        on_interrupt.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown.cancel();
                }
                Err(err) => warn!(error = %err, "failed to install SIGTERM handler"),
            }
        });
    }
}
