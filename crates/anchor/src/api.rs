//! REST Control Surface
//!
//! Thin axum layer over [`FailoverCoordinator`]. Every handler delegates to
//! the coordinator; nothing here holds state of its own.

use anchor_failover::{CoordinatorError, CoordinatorStatus, FailoverCoordinator, IpCheck, Mode};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Mode change / lifecycle response
#[derive(Debug, Serialize, Deserialize)]
pub struct ModeResponse {
    pub mode: Mode,
    pub running: bool,
    pub message: String,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn internal(e: CoordinatorError) -> ApiError {
    let status = match e {
        CoordinatorError::NotRunning => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    warn!("Control request failed: {}", e);
    error(status, e.to_string())
}

/// Build the control router for `coordinator`
pub fn router(coordinator: FailoverCoordinator) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/start", post(start_handler))
        .route("/stop", post(stop_handler))
        .route("/mode/{mode}", post(mode_handler))
        .route("/ip/check", get(ip_check_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(coordinator)
}

/// GET /health
pub async fn health_handler(State(coordinator): State<FailoverCoordinator>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": coordinator.mode(),
    }))
}

/// GET /status
pub async fn status_handler(
    State(coordinator): State<FailoverCoordinator>,
) -> Json<CoordinatorStatus> {
    Json(coordinator.status().await)
}

/// POST /start
///
/// A failed VPN attempt still answers 200: the coordinator is running and
/// has fallen back to the relay.
pub async fn start_handler(
    State(coordinator): State<FailoverCoordinator>,
) -> Result<Json<ModeResponse>, ApiError> {
    let mode = coordinator.start().await.map_err(internal)?;
    info!("Coordinator started via API in {} mode", mode);

    Ok(Json(ModeResponse {
        mode,
        running: coordinator.is_running(),
        message: format!("Coordinator running in {} mode", mode),
    }))
}

/// POST /stop
pub async fn stop_handler(
    State(coordinator): State<FailoverCoordinator>,
) -> Result<Json<ModeResponse>, ApiError> {
    coordinator.stop().await.map_err(internal)?;

    Ok(Json(ModeResponse {
        mode: coordinator.mode(),
        running: false,
        message: "Coordinator stopped".to_string(),
    }))
}

/// POST /mode/{mode}
///
/// Answers 409 while the coordinator is stopped.
pub async fn mode_handler(
    State(coordinator): State<FailoverCoordinator>,
    Path(raw): Path<String>,
) -> Result<Json<ModeResponse>, ApiError> {
    let mode = match raw.parse::<Mode>() {
        Ok(Mode::None) | Err(_) => {
            return Err(error(
                StatusCode::BAD_REQUEST,
                format!("Invalid mode '{}' (expected vpn, proxy or direct)", raw),
            ));
        }
        Ok(mode) => mode,
    };

    let mode = coordinator.force_mode(mode).await.map_err(internal)?;

    Ok(Json(ModeResponse {
        mode,
        running: coordinator.is_running(),
        message: format!("Mode set to {}", mode),
    }))
}

/// GET /ip/check
pub async fn ip_check_handler(State(coordinator): State<FailoverCoordinator>) -> Json<IpCheck> {
    Json(coordinator.check_ip().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anchor_network::{EgressProbe, NetworkError};
    use anchor_vpn::ConnectionConfig;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const TARGET: &str = "203.0.113.50";

    struct FixedProbe(Option<IpAddr>);

    #[async_trait]
    impl EgressProbe for FixedProbe {
        async fn probe(&self, timeout: Duration) -> Result<IpAddr, NetworkError> {
            self.0.ok_or(NetworkError::Timeout(timeout))
        }
    }

    fn coordinator(egress: Option<&str>) -> FailoverCoordinator {
        let mut config = ConnectionConfig::new(TARGET.parse().unwrap());
        config.proxy_listen_port = 0;
        config.vpn_client_path = "/nonexistent/openvpn".into();

        FailoverCoordinator::builder(config)
            .probe(Arc::new(FixedProbe(egress.map(|ip| ip.parse().unwrap()))))
            .build()
            .unwrap()
    }

    async fn call(app: Router, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(router(coordinator(None)), Method::GET, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["mode"], "none");
    }

    #[tokio::test]
    async fn test_start_status_stop() {
        let coordinator = coordinator(Some(TARGET));
        let app = router(coordinator.clone());

        let (status, body) = call(app.clone(), Method::POST, "/start").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "direct");
        assert_eq!(body["running"], true);

        let (status, body) = call(app.clone(), Method::GET, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["running"], true);
        assert_eq!(body["connection"]["mode"], "direct");
        assert_eq!(body["connection"]["is_target_ip"], true);
        assert_eq!(body["recent_events"][0]["event_type"], "direct_connection_detected");

        let (status, body) = call(app, Method::POST, "/stop").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "none");
        assert!(!coordinator.is_running());
    }

    #[tokio::test]
    async fn test_force_mode() {
        let coordinator = coordinator(Some("198.51.100.1"));
        let app = router(coordinator.clone());

        let (status, _) = call(app.clone(), Method::POST, "/start").await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(app.clone(), Method::POST, "/mode/proxy").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "proxy");
        assert_eq!(coordinator.mode(), Mode::Proxy);

        let (status, body) = call(app.clone(), Method::POST, "/mode/DIRECT").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mode"], "direct");

        call(app, Method::POST, "/stop").await;
    }

    #[tokio::test]
    async fn test_mode_change_requires_running_coordinator() {
        let coordinator = coordinator(Some("198.51.100.1"));
        let app = router(coordinator.clone());

        let (status, body) = call(app.clone(), Method::POST, "/mode/proxy").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("not running"));
        assert_eq!(coordinator.mode(), Mode::None);

        let (_, body) = call(app.clone(), Method::GET, "/status").await;
        assert!(body["proxy_addr"].is_null());

        call(app.clone(), Method::POST, "/start").await;
        call(app.clone(), Method::POST, "/stop").await;

        let (status, _) = call(app, Method::POST, "/mode/direct").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(coordinator.mode(), Mode::None);
    }

    #[tokio::test]
    async fn test_invalid_mode_rejected() {
        let coordinator = coordinator(None);
        let app = router(coordinator.clone());

        let (status, body) = call(app.clone(), Method::POST, "/mode/turbo").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("turbo"));

        let (status, _) = call(app, Method::POST, "/mode/none").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(coordinator.mode(), Mode::None);
    }

    #[tokio::test]
    async fn test_failed_vpn_override_is_500() {
        let coordinator = coordinator(Some("198.51.100.1"));
        let app = router(coordinator.clone());

        // Missing client: start falls back to the relay
        let (_, body) = call(app.clone(), Method::POST, "/start").await;
        assert_eq!(body["mode"], "proxy");

        let (status, body) = call(app.clone(), Method::POST, "/mode/vpn").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].is_string());
        assert_eq!(coordinator.mode(), Mode::Proxy);

        call(app, Method::POST, "/stop").await;
    }

    #[tokio::test]
    async fn test_ip_check() {
        let (status, body) = call(router(coordinator(Some(TARGET))), Method::GET, "/ip/check").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["current_ip"], TARGET);
        assert_eq!(body["is_target_ip"], true);

        let (status, body) = call(router(coordinator(None)), Method::GET, "/ip/check").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["current_ip"].is_null());
        assert_eq!(body["is_target_ip"], false);
        assert!(body["error"].is_string());
    }
}
