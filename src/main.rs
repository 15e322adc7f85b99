//! # Voice Relay Server
//!
//! Entry point: loads configuration, sets up tracing, builds the shared state, and
//! serves the relay endpoints until SIGINT or SIGTERM.
//!
//! ## Routes:
//! - `GET /ws`: duplex session WebSocket
//! - `GET /pipeline`: discrete turn WebSocket
//! - `POST /transcribe`, `POST /generate`, `GET|DELETE /audio/{call_id}`: HTTP turns
//! - `GET /status`, `GET /prewarm`: collaborator readiness and warm-up
//! - `GET /health`, `GET /api/v1/health`, `GET /api/v1/metrics`: monitoring

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voice_relay::config::AppConfig;
use voice_relay::state::AppState;
use voice_relay::{handlers, health, websocket};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        frame_size = config.duplex.frame_size,
        sample_rate = config.duplex.sample_rate,
        chunking = ?config.pipeline.chunking,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let max_body_bytes = config.server.max_frame_bytes;
    let app_state = AppState::new(config)?;

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .app_data(web::PayloadConfig::new(max_body_bytes))
            .app_data(web::JsonConfig::default().limit(max_body_bytes))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/status", web::get().to(health::status))
            .route("/prewarm", web::get().to(health::prewarm))
            .route("/ws", web::get().to(websocket::duplex_websocket))
            .route("/pipeline", web::get().to(websocket::pipeline_websocket))
            .route("/transcribe", web::post().to(handlers::transcribe))
            .route("/generate", web::post().to(handlers::generate))
            .route("/audio/{call_id}", web::get().to(handlers::get_audio))
            .route("/audio/{call_id}", web::delete().to(handlers::cancel_audio))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        signal = shutdown_signal() => {
            if let Err(e) = signal {
                error!("Signal handler error: {}", e);
            }
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Console tracing, filtered by `RUST_LOG`.
///
/// Defaults to `voice_relay=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on the first SIGTERM or SIGINT.
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}
