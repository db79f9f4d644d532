//! # Consult Live Backend - Main Application Entry Point
//!
//! Backend for a live voice medical consultation. A browser client streams
//! microphone audio over a WebSocket; the server relays it to a remote live
//! model session and schedules the model's spoken replies back to the client,
//! gapless and in order.
//!
//! ## Application Architecture:
//! - **config**: Layered configuration (TOML file + environment variables)
//! - **state**: Shared application state and HTTP metrics
//! - **audio**: Frame codec, volume metering, capture loop, playback scheduling
//! - **device**: Channel-backed capture/playback device contexts
//! - **remote**: Live session transport (WebSocket to the model API)
//! - **session**: The consultation lifecycle state machine
//! - **websocket**: Bridge between the browser client and the session core
//! - **handlers/health/middleware/error**: The HTTP surface around it all

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod remote;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use device::ChannelDeviceProvider;
use remote::LiveApiConnector;
use session::SessionLifecycleController;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown flag set by the signal handler task.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting consult-live-backend v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {}:{}, capture {} Hz, playback {} Hz",
        config.server.host,
        config.server.port,
        config.audio.capture_sample_rate,
        config.audio.playback_sample_rate
    );

    // Device endpoints are installed by the WebSocket bridge; the session
    // controller acquires them on start.
    let devices = Arc::new(ChannelDeviceProvider::new());
    let connector = Arc::new(LiveApiConnector::new(
        config.remote.clone(),
        config.audio.playback_sample_rate,
    ));
    let consult = SessionLifecycleController::spawn(
        config.audio.clone(),
        devices.clone(),
        connector,
    );

    let app_state = AppState::new(config.clone(), consult.clone(), devices);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(Logger::default())
            .wrap(middleware::HttpMetrics)
            .wrap(middleware::RequestLog)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::config::get_config))
                    .route("/config", web::put().to(handlers::config::update_config))
                    .route(
                        "/consult/start",
                        web::post().to(handlers::consult::start_consult),
                    )
                    .route(
                        "/consult/stop",
                        web::post().to(handlers::consult::stop_consult),
                    )
                    .route(
                        "/consult/status",
                        web::get().to(handlers::consult::consult_status),
                    ),
            )
            .route("/ws/consult", web::get().to(websocket::consult_websocket))
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            // End any live consultation before the HTTP surface goes away
            consult.stop();
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize structured logging. `RUST_LOG` overrides the default filter.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "consult_live_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Install SIGTERM/SIGINT handlers that set the global shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Poll the shutdown flag until it is set.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
