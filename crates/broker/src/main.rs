//! tickline broker binary.

use anyhow::Result;
use tickline_broker::{Broker, BrokerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => BrokerConfig::load(path),
        None => BrokerConfig::load("broker.toml"),
    };
    info!(bind_addr = %config.bind_addr, data_dir = ?config.data_dir, "starting broker");

    let broker = Broker::bind(&config)?;
    info!(addr = %broker.local_addr()?, "broker listening");

    tokio::select! {
        result = broker.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            broker.close();
            Ok(())
        }
    }
}
