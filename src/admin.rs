//! Authenticated HTTP control surface: version, stats and imperative
//! image rollouts. Everything except `/ping` requires the bearer token.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::Orchestrator;

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<dyn Orchestrator>,
    auth_token: Arc<String>,
    version: &'static str,
    started_at: Instant,
}

pub fn router(orchestrator: Arc<dyn Orchestrator>, auth_token: String) -> Router {
    let state = AppState {
        orchestrator,
        auth_token: Arc::new(auth_token),
        version: env!("CARGO_PKG_VERSION"),
        started_at: Instant::now(),
    };
    Router::new()
        .route("/version", get(version))
        .route("/stats", get(stats))
        .route("/v1/update/:service_name", post(update_service))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ))
        .route("/ping", get(|| async { "pong" }))
        .with_state(state)
}

/// Serve the control surface until cancellation; in-flight requests
/// drain within the caller's shutdown deadline.
pub async fn serve(router: Router, port: u16, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding admin listener on port {port}"))?;
    info!("admin surface listening on port {port}");
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("admin server failed")
}

async fn require_bearer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| bool::from(token.as_bytes().ct_eq(state.auth_token.as_bytes())))
        .unwrap_or(false);
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    next.run(request).await
}

async fn version(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "version": state.version }))
}

async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": state.version,
        "uptime": format_uptime(state.started_at.elapsed()),
    }))
}

#[derive(Deserialize)]
struct UpdateParams {
    image: Option<String>,
}

async fn update_service(
    State(state): State<AppState>,
    Path(service_name): Path<String>,
    Query(params): Query<UpdateParams>,
) -> Response {
    let Some(image) = params.image.filter(|image| !image.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing image in query").into_response();
    };

    info!("rollout requested: {service_name} -> {image}");
    match state
        .orchestrator
        .update_service_image(&service_name, &image)
        .await
    {
        Ok(receipt) => Json(receipt).into_response(),
        Err(e) => {
            error!("rollout of {service_name} failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")).into_response()
        }
    }
}

fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uptime_renders_as_hours_minutes_seconds() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_uptime(Duration::from_secs(3_725)), "01:02:05");
        assert_eq!(format_uptime(Duration::from_secs(100 * 3600)), "100:00:00");
    }
}
