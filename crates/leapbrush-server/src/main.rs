//! LeapBrush server binary.
//!
//! # Usage
//!
//! ```bash
//! # Start with self-signed certificate (development, clients use the
//! # plaintext scheme)
//! leapbrush-server --bind 0.0.0.0:8402
//!
//! # Start with TLS certificate (production)
//! leapbrush-server --bind 0.0.0.0:8402 --cert cert.pem --key key.pem
//! ```

use std::{sync::Arc, time::Duration};

use clap::Parser;
use leapbrush_server::{Server, ServerRuntimeConfig, WorldConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// LeapBrush session server
#[derive(Parser, Debug)]
#[command(name = "leapbrush-server")]
#[command(about = "LeapBrush shared drawing session server")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8402")]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<String>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<String>,

    /// Seconds without updates before a user is dropped
    #[arg(long, default_value = "10")]
    user_timeout_secs: u64,

    /// Log every stroke and model change
    #[arg(short, long)]
    verbose: bool,

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

    tracing::info!("LeapBrush server starting");
    tracing::info!("Binding to {}", args.bind);

    if args.cert.is_none() || args.key.is_none() {
        tracing::warn!("No TLS certificate provided - using self-signed certificate");
    }

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        cert_path: args.cert,
        key_path: args.key,
        world: WorldConfig {
            user_timeout: Duration::from_secs(args.user_timeout_secs),
            verbose: args.verbose,
            ..WorldConfig::default()
        },
    };

    let server = Arc::new(Server::bind(config)?);

    tracing::info!("Server listening on {}", server.local_addr()?);

    let stopper = Arc::clone(&server);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => stopper.shutdown(),
            Err(e) => tracing::warn!("cannot listen for ctrl-c: {}", e),
        }
    });

    server.run().await?;

    Ok(())
}
