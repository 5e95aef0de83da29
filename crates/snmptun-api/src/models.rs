use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use snmptun_lease::LeaseView;

/// One active lease
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LeaseSummary {
    /// Lease owner id
    pub owner_id: String,
    /// Kind of caller (device-probe, test-run, ...)
    pub owner_kind: String,
    /// Local port of the forwarder
    pub port: u16,
    /// Device the tunnel points at
    pub device_ip: String,
    /// SSH username on the device
    pub username: String,
    /// When the lease was first taken
    pub created_at: DateTime<Utc>,
    /// Last renewal
    pub last_heartbeat: DateTime<Utc>,
    /// When the lease lapses without a heartbeat
    pub expires_at: DateTime<Utc>,
    /// Lease lifetime in seconds
    pub ttl_secs: u64,
}

impl From<LeaseView> for LeaseSummary {
    fn from(view: LeaseView) -> Self {
        Self {
            owner_id: view.owner_id,
            owner_kind: view.owner_kind,
            port: view.port,
            device_ip: view.device_ip,
            username: view.username,
            created_at: view.created_at,
            last_heartbeat: view.last_heartbeat,
            expires_at: view.expires_at,
            ttl_secs: view.ttl.as_secs(),
        }
    }
}

/// Tunnel diagnostics
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TunnelStatusResponse {
    /// Whether the forwarder is running
    pub alive: bool,
    /// Ports the forwarder may bind, in preference order
    pub configured_ports: Vec<u16>,
    /// Port the forwarder is bound to, if running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_port: Option<u16>,
    /// Active leases
    pub leases: Vec<LeaseSummary>,
}

/// Reserve the tunnel for a device
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReserveRequest {
    /// Key the reservation is tracked under
    pub tracking_key: String,
    /// Kind of caller
    #[serde(default = "default_owner_kind")]
    pub owner_kind: String,
    /// Device address
    pub device_ip: String,
    /// SSH username
    pub username: String,
    /// SSH password
    #[serde(default)]
    pub password: String,
    /// Lease lifetime in seconds (server default if omitted)
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    /// Replace any earlier reservation under the same key
    #[serde(default = "default_track")]
    pub track: bool,
}

fn default_owner_kind() -> String {
    "api".to_string()
}

fn default_track() -> bool {
    true
}

/// Granted reservation
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReserveResponse {
    /// Owner id of the granted lease
    pub owner_id: String,
    /// Host the forwarder listens on
    pub host: String,
    /// Port the forwarder listens on
    pub port: u16,
    /// When the lease lapses without a heartbeat
    pub expires_at: DateTime<Utc>,
}

/// Heartbeat query parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct HeartbeatQuery {
    /// New lease lifetime in seconds
    pub ttl_secs: Option<u64>,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Whether the forwarder is running
    pub tunnel_alive: bool,
    /// Active lease count
    pub active_leases: usize,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
