//! # Health, Readiness and Warm-up Endpoints
//!
//! - **GET /health**, **GET /api/v1/health**: liveness, always 200 while serving
//! - **GET /api/v1/metrics**: relay counters and per-collaborator call statistics
//! - **GET /status**: collaborator → ready map; 200 only when all are warm and idle
//! - **GET /prewarm**: warm every collaborator concurrently, optionally fill the
//!   filler cache, then report like `/status`

use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::{info, warn};

use crate::state::AppState;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;
    let active = state.metrics.active_sessions();
    let max = config.performance.max_concurrent_sessions;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "active": active,
            "max": max,
            "load": load_level(active, max)
        },
        "memory": memory_info()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let registry = state.registry.summary().await;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.uptime_seconds(),
        "relay": state.metrics.snapshot(),
        "collaborators": registry.collaborators,
        "fillers_cached": state.fillers.len().await,
        "memory": memory_info()
    }))
}

/// Readiness probe.
///
/// ## Returns:
/// - **200**: every collaborator is warm with no calls outstanding
/// - **503**: otherwise; the body still carries the full map
pub async fn status(state: web::Data<AppState>) -> HttpResponse {
    let readiness = state.registry.readiness().await;
    if readiness.values().all(|ready| *ready) {
        HttpResponse::Ok().json(readiness)
    } else {
        HttpResponse::ServiceUnavailable().json(readiness)
    }
}

/// Warm every collaborator, then answer with the readiness map.
pub async fn prewarm(state: web::Data<AppState>) -> HttpResponse {
    info!("Prewarming collaborators");
    let mut failure = state
        .registry
        .prewarm(&state.collaborators)
        .await
        .err()
        .map(|e| e.to_string());

    if failure.is_none() && state.config.fillers.prefill_on_prewarm {
        match state
            .fillers
            .prefill(
                state.collaborators.synthesizer.as_ref(),
                &state.config.fillers.sentences,
            )
            .await
        {
            Ok(count) => info!(count, "Filler sentences cached"),
            Err(e) => failure = Some(e.to_string()),
        }
    }

    let readiness = state.registry.readiness().await;
    match failure {
        None => HttpResponse::Ok().json(readiness),
        Some(error) => {
            warn!(error = %error, "Prewarm incomplete");
            HttpResponse::ServiceUnavailable().json(json!({
                "error": error,
                "collaborators": readiness
            }))
        }
    }
}

fn load_level(active: usize, max: usize) -> &'static str {
    let usage = if max > 0 {
        active as f64 / max as f64
    } else {
        0.0
    };

    if usage >= 1.0 {
        "full"
    } else if usage > 0.7 {
        "high"
    } else {
        "normal"
    }
}

fn memory_info() -> serde_json::Value {
    match resident_memory_bytes() {
        Some(bytes) => json!({ "resident_memory_bytes": bytes, "available": true }),
        None => json!({ "available": false }),
    }
}

#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::testing::{mock_collaborators, MockSynthesizer, MockTranscriber};
    use actix_web::{http::StatusCode, test as actix_test, App};
    use serde_json::Value;

    fn state(synthesizer: MockSynthesizer, prefill: bool) -> AppState {
        let mut config = AppConfig::default();
        config.fillers.prefill_on_prewarm = prefill;
        let mocks = mock_collaborators(MockTranscriber::new(), vec![], synthesizer);
        AppState::with_collaborators(config, mocks.collaborators)
    }

    macro_rules! service {
        ($state:expr) => {
            actix_test::init_service(
                App::new()
                    .app_data(web::Data::new($state))
                    .route("/health", web::get().to(health_check))
                    .route("/status", web::get().to(status))
                    .route("/prewarm", web::get().to(prewarm))
                    .route("/api/v1/metrics", web::get().to(detailed_metrics)),
            )
            .await
        };
    }

    /// Test that readiness flips to 200 once prewarm has warmed everything.
    #[actix_web::test]
    async fn test_status_after_prewarm() {
        let app = service!(state(MockSynthesizer::new(), false));

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/status").to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["generator"], false);

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/prewarm").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/status").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = actix_test::read_body_json(resp).await;
        for kind in ["transcriber", "generator", "synthesizer", "duplex"] {
            assert_eq!(body[kind], true, "{} not ready", kind);
        }
    }

    #[actix_web::test]
    async fn test_prewarm_failure_is_503() {
        let app = service!(state(MockSynthesizer::new().failing_warm(), false));

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/prewarm").to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["collaborators"]["synthesizer"], false);
        assert_eq!(body["collaborators"]["transcriber"], true);
    }

    #[actix_web::test]
    async fn test_prewarm_fills_filler_cache() {
        let state = state(MockSynthesizer::new(), true);
        let fillers = state.fillers.clone();
        let app = service!(state);

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/prewarm").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(fillers.len().await, 3);
        assert!(fillers.contains("Sure.").await);
    }

    #[actix_web::test]
    async fn test_health_and_metrics() {
        let app = service!(state(MockSynthesizer::new(), false));

        let resp = actix_test::call_service(&app, actix_test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["sessions"]["active"], 0);

        let resp =
            actix_test::call_service(&app, actix_test::TestRequest::get().uri("/api/v1/metrics").to_request()).await;
        let body: Value = actix_test::read_body_json(resp).await;
        assert_eq!(body["relay"]["sessions_started"], 0);
        assert_eq!(body["collaborators"]["duplex"]["status"]["state"], "cold");
    }

    #[test]
    fn test_load_level() {
        assert_eq!(load_level(0, 10), "normal");
        assert_eq!(load_level(8, 10), "high");
        assert_eq!(load_level(10, 10), "full");
    }
}
