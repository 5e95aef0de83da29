//! HTTP API for the SNMP tunnel lease manager
pub mod handlers;
pub mod models;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{delete, get, post},
    Json, Router,
};
use std::{net::SocketAddr, sync::Arc};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use utoipa::OpenApi;

use snmptun_lease::TunnelService;

/// Application state shared across handlers
pub struct AppState {
    pub service: Arc<TunnelService>,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "SNMP Tunnel API",
        version = "0.1.0",
        description = "Leases on the shared SNMP-over-SSH tunnel"
    ),
    paths(
        handlers::tunnel_status,
        handlers::reserve,
        handlers::heartbeat,
        handlers::release,
        handlers::health_check,
    ),
    components(
        schemas(
            models::LeaseSummary,
            models::TunnelStatusResponse,
            models::ReserveRequest,
            models::ReserveResponse,
            models::HeartbeatQuery,
            models::HealthResponse,
            models::ErrorResponse,
        )
    ),
    tags(
        (name = "tunnels", description = "Tunnel lease endpoints"),
        (name = "system", description = "System health and info endpoints")
    )
)]
pub struct ApiDoc;

/// API server configuration
pub struct ApiServerConfig {
    /// Address to bind the API server
    pub bind_addr: SocketAddr,
    /// Enable CORS for local web frontends
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            enable_cors: true,
        }
    }
}

/// API Server
pub struct ApiServer {
    config: ApiServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, service: Arc<TunnelService>) -> Self {
        Self {
            config,
            state: Arc::new(AppState { service }),
        }
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        let router = Router::new()
            .route("/api/health", get(handlers::health_check))
            .route("/api/tunnels", get(handlers::tunnel_status))
            .route("/api/tunnels/reservations", post(handlers::reserve))
            .route(
                "/api/tunnels/reservations/{key}",
                delete(handlers::release),
            )
            .route(
                "/api/tunnels/reservations/{key}/heartbeat",
                post(handlers::heartbeat),
            )
            .route("/api/openapi.json", get(openapi_json))
            .with_state(self.state.clone());

        let mut router = router.layer(TraceLayer::new_for_http());

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE])
                .allow_origin(tower_http::cors::AllowOrigin::predicate(
                    |origin: &HeaderValue, _| {
                        let origin = origin.to_str().unwrap_or("");
                        origin.starts_with("http://localhost:")
                            || origin.starts_with("http://127.0.0.1:")
                    },
                ));
            router = router.layer(cors);
        }

        router
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(self, shutdown: F) -> Result<(), anyhow::Error>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();

        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!("Starting API server on {}", local_addr);
        info!("OpenAPI spec: http://{}/api/openapi.json", local_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

        info!("API server stopped");
        Ok(())
    }
}

async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_generation() {
        let doc = ApiDoc::openapi();
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json["paths"]["/api/tunnels/reservations"].is_object());
        assert!(json["paths"]["/api/health"].is_object());
    }
}
