use axum::{routing::get, Router};
use clap::Parser;
use gps_simulator::config::Config;
use gps_simulator::errors::Result;
use gps_simulator::metrics;
use gps_simulator::publisher::Publisher;
use gps_simulator::session::MqttSession;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::net::SocketAddr;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();

    if let Err(e) = run(config).await {
        error!("Simulator failed: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<()> {
    config.validate()?;

    info!("Starting GPS simulator");
    info!(
        "Hub: {}, device: {}, interval: {:?}, on connection loss: {:?}",
        config.hostname(),
        config.device_id,
        config.interval(),
        config.on_connection_loss
    );

    if let Some(addr) = config.metrics_addr {
        metrics::init_metrics()?;
        serve_metrics(addr).await?;
    }

    let rng = match config.seed {
        Some(seed) => {
            info!("Using RNG seed {}", seed);
            StdRng::seed_from_u64(seed)
        }
        None => StdRng::from_entropy(),
    };

    let (session, events) = MqttSession::connect(&config)?;
    let publisher = Publisher::new(config, session, events, rng);

    let stats = publisher
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for interrupt: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Simulation stopped, {} messages sent", stats.sent);
    Ok(())
}

async fn serve_metrics(addr: SocketAddr) -> Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Metrics listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
