use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use icebreaker::activation::ack::HttpAckSender;
use icebreaker::activation::logs::DockerLogCollector;
use icebreaker::activation::store::RestActivationStore;
use icebreaker::container::docker::DockerContainerFactory;
use icebreaker::core::pool::{NoopFeed, PoolOptions};
use icebreaker::{Invoker, InvokerServices};

/// icebreaker — ML-aware serverless invoker
#[derive(Parser)]
#[command(name = "icebreaker", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "invoker.toml")]
    config: String,

    /// Override the invoker id
    #[arg(long)]
    invoker_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    tracing::info!("icebreaker v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config = if std::path::Path::new(&cli.config).exists() {
        tracing::info!(config = cli.config, "Loading configuration");
        icebreaker::config::InvokerConfig::from_file(&cli.config).await?
    } else {
        tracing::warn!("Config file not found, using defaults");
        icebreaker::config::InvokerConfig::default()
    };

    if let Some(id) = cli.invoker_id {
        config.invoker_id = id;
    }

    let services = InvokerServices {
        factory: Arc::new(DockerContainerFactory::new(config.container_factory.clone())),
        ack: Arc::new(HttpAckSender::new(config.controller_url.clone())),
        store: Arc::new(RestActivationStore::new(config.activation_store_url.clone())),
        logs: Arc::new(DockerLogCollector::new(
            config.container_factory.docker_host.clone(),
            config.log_limit,
        )),
        feed: Arc::new(NoopFeed),
        options: PoolOptions::default(),
    };

    let invoker = Arc::new(Invoker::new(config, services)?);
    invoker.start()?;

    tracing::info!("Invoker ready — press Ctrl+C to stop");
    invoker.wait_for_shutdown().await;

    Ok(())
}
