//! tidecast gateway binary.

use std::sync::Arc;

use clap::Parser;
use tidecast_core::{Connection, LineConnection};
use tidecast_gateway::{Args, GatewayConfig};
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tidecast_gateway={0},tidecast_core={0},tower_http=info",
            args.log_level
        ))
    });
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config = GatewayConfig::from(&args);

    if config.broker.publish_buffer == 0 || config.broker.subscriber_buffer == 0 {
        anyhow::bail!("broker buffers must hold at least one event");
    }
    if config.tail.channel_size == 0 {
        anyhow::bail!("channel_size must be at least 1");
    }

    info!(
        listen = %config.listen_addr,
        input = ?config.input,
        overflow = %config.broker.overflow,
        "Starting tidecast gateway"
    );

    let connection: Arc<dyn Connection> = match &config.input {
        Some(path) => {
            let file = tokio::fs::File::open(path).await?;
            Arc::new(LineConnection::new(BufReader::new(file)))
        }
        None => Arc::new(LineConnection::new(BufReader::new(tokio::io::stdin()))),
    };

    for route in &config.routes {
        info!(path = %route.path, namespace = ?route.namespace, "Route registered");
    }

    let playback = config
        .playlist()
        .play(connection, config.tail.clone(), config.broker.clone());

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("Gateway listening on {}", config.listen_addr);

    axum::serve(listener, playback.router).await?;

    Ok(())
}
