//! LeapBrush test client entry point.
//!
//! # Usage
//!
//! ```bash
//! # Two users drawing on the same anchor of a local server
//! leapbrush-test-client --name alice --found-anchor table --create-brush-strokes
//! leapbrush-test-client --name bob --found-anchor table --color ff0000ff
//! ```

use clap::Parser;
use leapbrush_client::{
    CancelToken, Lifecycle, QuicConnector, RetryPolicy, ServerEndpoint, TransportConfig,
};
use leapbrush_test_client::{Scene, SceneConfig, parse_color, run};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// LeapBrush test client
#[derive(Parser, Debug)]
#[command(name = "leapbrush-test-client")]
#[command(about = "Simulated headset for LeapBrush servers")]
#[command(version)]
struct Args {
    /// Server to connect to, `[ssl://]host[:port]`
    #[arg(short, long, default_value = "localhost:8402")]
    addr: String,

    /// User name
    #[arg(short, long, default_value = "TEST_USER_DEFAULT")]
    name: String,

    /// Ask the server to echo our own changes back
    #[arg(long)]
    echo: bool,

    /// Anchor to report as found (two fake anchors otherwise)
    #[arg(long)]
    found_anchor: Option<String>,

    /// Draw and erase a brush stroke every two seconds
    #[arg(long)]
    create_brush_strokes: bool,

    /// Brush stroke color as hex RRGGBBAA
    #[arg(long, value_parser = parse_color)]
    color: Option<u32>,

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

    let endpoint = ServerEndpoint::parse(&args.addr)?;
    tracing::info!("Connecting to server {}", endpoint);

    let lifecycle = Lifecycle::new(
        QuicConnector::new(),
        endpoint,
        TransportConfig::default(),
        RetryPolicy::default(),
    );
    let scene = Scene::new(SceneConfig {
        user_name: args.name,
        echo: args.echo,
        found_anchor: args.found_anchor,
        create_brush_strokes: args.create_brush_strokes,
        color: args.color.unwrap_or(0),
    });

    let cancel = CancelToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Received stop signal");
                stopper.cancel();
            },
            Err(e) => tracing::warn!("cannot listen for ctrl-c: {}", e),
        }
    });

    run(lifecycle, scene, cancel).await?;

    tracing::info!("Shut down complete");
    Ok(())
}
