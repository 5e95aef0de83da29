//! Integration tests for the tunnel lease endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use snmptun_api::{models::*, ApiServer, ApiServerConfig};
use snmptun_lease::{MemoryProxyController, TunnelManager, TunnelManagerConfig, TunnelService};
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt; // For `oneshot` method

/// Helper to create a router over an in-memory forwarder
fn create_test_app(ports: Vec<u16>) -> (Router, Arc<TunnelService>) {
    let manager = TunnelManager::new(
        Arc::new(MemoryProxyController::new()),
        TunnelManagerConfig {
            ports,
            cleanup_interval: Duration::from_secs(3600),
            ..TunnelManagerConfig::default()
        },
    )
    .expect("Failed to create tunnel manager");

    let service = Arc::new(TunnelService::new(manager));
    let server = ApiServer::new(
        ApiServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            enable_cors: false,
        },
        service.clone(),
    );

    (server.build_router(), service)
}

fn free_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn reserve_request(key: &str, device_ip: &str) -> Request<Body> {
    let body = json!({
        "tracking_key": key,
        "owner_kind": "test-run",
        "device_ip": device_ip,
        "username": "admin",
        "password": "secret",
        "ttl_secs": 60
    });

    Request::builder()
        .uri("/api/tunnels/reservations")
        .method("POST")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn test_reserve_and_describe() {
    let port = free_port();
    let (app, service) = create_test_app(vec![port]);

    let response = app
        .clone()
        .oneshot(reserve_request("job-1", "10.0.0.5"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let granted: ReserveResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(granted.port, port);
    assert_eq!(granted.host, "127.0.0.1");
    assert!(granted.owner_id.starts_with("job-1#"));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/tunnels")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let status = body_json(response).await;
    assert_eq!(status["alive"], true);
    assert_eq!(status["configured_ports"], json!([port]));
    assert_eq!(status["leases"][0]["device_ip"], "10.0.0.5");
    assert_eq!(status["leases"][0]["ttl_secs"], 60);
    assert!(status["leases"][0].get("password").is_none());

    service.release("job-1").await;
    service.manager().shutdown().await;
}

#[tokio::test]
async fn test_conflicting_device_returns_409() {
    let (app, service) = create_test_app(vec![free_port()]);

    let response = app
        .clone()
        .oneshot(reserve_request("job-1", "10.0.0.5"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .oneshot(reserve_request("job-2", "10.0.0.9"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let error: ErrorResponse =
        serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(error.code.as_deref(), Some("TUNNEL_DEVICE_CONFLICT"));

    service.release("job-1").await;
    service.manager().shutdown().await;
}

#[tokio::test]
async fn test_all_ports_busy_returns_503() {
    let busy = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = busy.local_addr().unwrap().port();
    let (app, service) = create_test_app(vec![port]);

    let response = app
        .oneshot(reserve_request("job-1", "10.0.0.5"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let error = body_json(response).await;
    assert_eq!(error["code"], "TUNNEL_PORTS_BUSY");
    assert!(!service.tunnel_alive());

    drop(busy);
    service.manager().shutdown().await;
}

#[tokio::test]
async fn test_reserve_validation() {
    let (app, service) = create_test_app(vec![free_port()]);

    let response = app
        .oneshot(reserve_request("job-1", "  "))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let error = body_json(response).await;
    assert_eq!(error["code"], "VALIDATION_ERROR");
    assert!(service.describe().await.is_empty());

    service.manager().shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_and_release() {
    let (app, service) = create_test_app(vec![free_port()]);

    let response = app
        .clone()
        .oneshot(reserve_request("poller", "10.0.0.5"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/tunnels/reservations/poller/heartbeat?ttl_secs=300")
                .method("POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(service.describe().await[0].ttl, Duration::from_secs(300));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/tunnels/reservations/ghost/heartbeat")
                .method("POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/tunnels/reservations/poller")
                    .method("DELETE")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    assert!(service.describe().await.is_empty());
    assert!(!service.tunnel_alive());
    service.manager().shutdown().await;
}

#[tokio::test]
async fn test_health_and_openapi() {
    let (app, service) = create_test_app(vec![free_port()]);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let health: HealthResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(health.status, "healthy");
    assert!(!health.tunnel_alive);
    assert_eq!(health.active_leases, 0);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/openapi.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let doc = body_json(response).await;
    assert!(doc["paths"]["/api/tunnels"].is_object());

    service.manager().shutdown().await;
}
