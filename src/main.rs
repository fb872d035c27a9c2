use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tsync::config::SenderConfig;
use tsync::lock::LockGuard;
use tsync::sender::SyncSender;

#[derive(Parser)]
#[command(
    name = "tsync",
    version,
    about = "One-way incremental replication sender for time-series data files"
)]
struct Cli {
    /// Path to the sender configuration file
    #[arg(long, env = "TSYNC_CONFIG", default_value = "tsync.toml")]
    config: PathBuf,

    /// Receiver address override (host:port)
    #[arg(long)]
    server: Option<String>,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SenderConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    if let Some(server) = &cli.server {
        let (host, port) = server
            .split_once(':')
            .context("--server expects host:port")?;
        config.host = host.to_string();
        config.port = port.parse().context("--server expects a numeric port")?;
    }

    let _lock = match LockGuard::acquire(&config.lock_path()) {
        Ok(guard) => guard,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let sender = SyncSender::new(config);

    if cli.once {
        sender.sync_all().await?;
        return Ok(());
    }

    tokio::select! {
        result = sender.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            sender.stop();
        }
    }

    Ok(())
}
