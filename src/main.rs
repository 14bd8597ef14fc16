use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use modelgate::config::{Config, DEFAULT_CONFIG_PATH};
use modelgate::gateway::Gateway;

/// Reverse-proxy API gateway for AI-model HTTP APIs: per-client auth, rate
/// limiting and usage metrics in front of a single upstream (spec §1, §6).
#[derive(Parser, Debug)]
#[command(name = "modelgate", version, about, long_about = None)]
struct Cli {
    /// Path to the YAML config file. Overrides the CONFIG_PATH environment
    /// variable, which in turn overrides the default of `config.yaml`.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // clap handles `-h`/`--help` and `-V`/`--version` itself; this call
    // exits the process before any of the lines below run for those flags.
    let cli = Cli::parse();

    dotenvy::dotenv().ok();

    let config_path = cli
        .config
        .or_else(|| std::env::var("CONFIG_PATH").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    // Configuration errors are fatal at start (spec §7 "configuration/startup"):
    // the message never echoes api_keys values.
    let config = Config::load(&config_path)
        .map_err(|e| anyhow::anyhow!("failed to load configuration from {config_path}: {e}"))?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            config.log_level.as_filter_str(),
        ))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        listen_port = config.listen_port,
        target_url = %config.target_url,
        auth_enabled = !config.api_keys.is_empty(),
        "starting modelgate"
    );

    let gateway = Gateway::build(config)?;
    let serve = gateway.start().await?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    gateway.stop().await?;
    // The serve task completes once the graceful shutdown handle releases it.
    let _ = serve.await;

    Ok(())
}
