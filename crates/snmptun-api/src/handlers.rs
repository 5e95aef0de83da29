use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use snmptun_lease::{ErrorKind, Target, TunnelError};

use crate::models::*;
use crate::AppState;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
            code: Some(code.to_string()),
        }),
    )
}

/// Map a lease manager error onto a status code and error code
pub fn tunnel_error_response(err: TunnelError) -> ApiError {
    warn!("Tunnel request failed: {}", err);

    if let TunnelError::ProxyStart(_) = err {
        return error_response(StatusCode::BAD_GATEWAY, "TUNNEL_START_FAILED", err.to_string());
    }

    match err.kind() {
        ErrorKind::PortsBusy => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "TUNNEL_PORTS_BUSY",
            err.to_string(),
        ),
        ErrorKind::Configuration => error_response(
            StatusCode::CONFLICT,
            "TUNNEL_DEVICE_CONFLICT",
            err.to_string(),
        ),
        ErrorKind::Manager => error_response(
            StatusCode::BAD_REQUEST,
            "TUNNEL_MANAGER_ERROR",
            err.to_string(),
        ),
    }
}

fn validation_error(message: &str) -> ApiError {
    error_response(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", message)
}

fn ttl(secs: Option<u64>) -> Option<Duration> {
    secs.map(Duration::from_secs)
}

/// Tunnel diagnostics: liveness, configured ports and active leases
#[utoipa::path(
    get,
    path = "/api/tunnels",
    responses(
        (status = 200, description = "Tunnel status", body = TunnelStatusResponse)
    ),
    tag = "tunnels"
)]
pub async fn tunnel_status(State(state): State<Arc<AppState>>) -> Json<TunnelStatusResponse> {
    debug!("Describing tunnel state");

    let manager = state.service.manager();
    let leases = state.service.describe().await;

    Json(TunnelStatusResponse {
        alive: state.service.tunnel_alive(),
        configured_ports: manager.configured_ports().to_vec(),
        active_port: manager.active_port().await,
        leases: leases.into_iter().map(LeaseSummary::from).collect(),
    })
}

/// Reserve the tunnel for a device
#[utoipa::path(
    post,
    path = "/api/tunnels/reservations",
    request_body = ReserveRequest,
    responses(
        (status = 201, description = "Lease granted", body = ReserveResponse),
        (status = 400, description = "Lease manager error", body = ErrorResponse),
        (status = 409, description = "Tunnel is held for another device", body = ErrorResponse),
        (status = 422, description = "Invalid request", body = ErrorResponse),
        (status = 502, description = "Forwarder failed to start", body = ErrorResponse),
        (status = 503, description = "All tunnel ports are busy", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn reserve(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ReserveRequest>,
) -> Result<(StatusCode, Json<ReserveResponse>), ApiError> {
    if req.tracking_key.trim().is_empty() {
        return Err(validation_error("tracking_key cannot be empty"));
    }
    if req.device_ip.trim().is_empty() {
        return Err(validation_error("device_ip cannot be empty"));
    }
    if req.username.trim().is_empty() {
        return Err(validation_error("username cannot be empty"));
    }

    info!(
        "Reserving tunnel for {} ({}@{})",
        req.tracking_key, req.username, req.device_ip
    );

    let target = Target::new(req.device_ip, req.username, req.password);
    let lease = state
        .service
        .reserve(
            &req.tracking_key,
            &req.owner_kind,
            target,
            ttl(req.ttl_secs),
            req.track,
        )
        .await
        .map_err(tunnel_error_response)?;

    // Untracked HTTP leases live until released by key or until they expire
    if !req.track {
        lease.detach();
    }

    let view = lease.info().await.map_err(tunnel_error_response)?;

    Ok((
        StatusCode::CREATED,
        Json(ReserveResponse {
            owner_id: lease.owner_id().to_string(),
            host: lease.host().to_string(),
            port: lease.port(),
            expires_at: view.expires_at,
        }),
    ))
}

/// Renew the lease held under a tracking key
#[utoipa::path(
    post,
    path = "/api/tunnels/reservations/{key}/heartbeat",
    params(
        ("key" = String, Path, description = "Tracking key"),
        ("ttl_secs" = Option<u64>, Query, description = "New lease lifetime in seconds")
    ),
    responses(
        (status = 204, description = "Lease renewed"),
        (status = 404, description = "No active lease under this key", body = ErrorResponse)
    ),
    tag = "tunnels"
)]
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<HeartbeatQuery>,
) -> Result<StatusCode, ApiError> {
    debug!("Heartbeat for {}", key);

    if state.service.heartbeat(&key, ttl(query.ttl_secs)).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(error_response(
            StatusCode::NOT_FOUND,
            "LEASE_NOT_FOUND",
            format!("No active lease for {}", key),
        ))
    }
}

/// Release the lease held under a tracking key
#[utoipa::path(
    delete,
    path = "/api/tunnels/reservations/{key}",
    params(
        ("key" = String, Path, description = "Tracking key")
    ),
    responses(
        (status = 204, description = "Lease released (or was not held)")
    ),
    tag = "tunnels"
)]
pub async fn release(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> StatusCode {
    info!("Releasing tunnel reservation {}", key);
    state.service.release(&key).await;
    StatusCode::NO_CONTENT
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let leases = state.service.describe().await;

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        tunnel_alive: state.service.tunnel_alive(),
        active_leases: leases.len(),
    })
}
