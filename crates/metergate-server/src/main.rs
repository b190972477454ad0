//! Metergate server binary.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: listen on 8899, passive DLMS, no polling
//! metergate-server
//!
//! # With a config file and a port override
//! metergate-server --config gateway.json --listen 9000
//! ```

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use metergate_server::{Bus, Gateway, GatewayConfig, InMemoryBus};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Electricity meter protocol gateway
#[derive(Parser, Debug)]
#[command(name = "metergate-server")]
#[command(about = "TCP gateway for R645 and DLMS electricity meters")]
#[command(version)]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the meter listen port
    #[arg(short, long)]
    listen: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(port) = args.listen {
        config.listen_port = port;
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "metergate starting");

    // Standalone runs use the in-process bus and mirror its traffic to the
    // log; deployments wire a broker adapter behind the same trait instead.
    let bus = Arc::new(InMemoryBus::new());
    {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            let mut rx = bus.subscribe("#").await;
            while let Some(message) = rx.recv().await {
                tracing::info!(
                    topic = %message.topic,
                    payload = %String::from_utf8_lossy(&message.payload),
                    "bus"
                );
            }
        });
    }

    let gateway = Gateway::bind(config, bus).await?;
    tracing::info!(addr = %gateway.local_addr()?, "listening for meters");

    let handle = gateway.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            handle.shutdown();
        }
    });

    gateway.run().await?;
    Ok(())
}
