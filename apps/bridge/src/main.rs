use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

use filament_bridge::cli::{self, Cli};
use filament_bridge::config::Config;
use filament_bridge::handlers::{self, AppState};
use filament_bridge::registry::Registry;
use filament_bridge::request_log::RequestLog;
use filament_bridge::udp;

#[tokio::main]
async fn main() {
    // Default to INFO so rescue events are visible without RUST_LOG set.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let args = Cli::parse();
    let config = Config::from_env();

    if let Some(command) = args.command {
        if let Err(e) = cli::run_command(command, &config).await {
            error!("{e:#}");
            std::process::exit(1);
        }
        return;
    }

    run_server(config).await;
}

async fn run_server(config: Config) {
    info!(
        "Starting filament bridge: http port {}, udp port {}, advertising {}",
        config.http_port, config.udp_port, config.advertised_addr
    );

    let registry = Arc::new(Registry::new(Duration::from_secs(config.stale_after_secs)));
    let log = Arc::new(RequestLog::default());

    // The UDP listener owns the fixed control port for the life of the
    // process; bulbs send unsolicited traffic here after registration.
    let udp_addr = format!("0.0.0.0:{}", config.udp_port);
    let socket = match tokio::net::UdpSocket::bind(&udp_addr).await {
        Ok(socket) => socket,
        Err(e) => {
            error!("failed to bind udp control port {udp_addr}: {e}");
            std::process::exit(1);
        }
    };
    tokio::spawn(udp::run_listener(socket, registry.clone()));
    info!("UDP control listener on {udp_addr}");

    let state = AppState {
        registry: registry.clone(),
        log,
        config: Arc::new(config.clone()),
        started_at: Instant::now(),
    };
    let app = handlers::router(state);

    let http_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = match tokio::net::TcpListener::bind(&http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {http_addr}: {e}");
            std::process::exit(1);
        }
    };
    info!("Cloud endpoints listening on {http_addr}");

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(registry));

    if let Err(e) = serve.await {
        error!("server error: {e}");
        std::process::exit(1);
    }
}

async fn shutdown_signal(registry: Arc<Registry>) {
    if tokio::signal::ctrl_c().await.is_err() {
        return;
    }
    let bulbs = registry.list();
    info!("Shutting down; {} bulb(s) tracked this run", bulbs.len());
    for record in bulbs {
        info!(
            "  {} at {} ({:?})",
            record.device_id,
            record
                .address
                .map(|a| a.to_string())
                .unwrap_or_else(|| "unknown".into()),
            record.status
        );
    }
}
