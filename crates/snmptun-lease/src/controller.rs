//! Boundary to the process that actually forwards SNMP traffic
//!
//! The tunnel manager owns exactly one [`ProxyController`] and is the only
//! component allowed to start or stop it.

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use thiserror::Error;

/// Device endpoint and credentials the forwarder is bound to
#[derive(Clone, PartialEq, Eq)]
pub struct Target {
    pub device_ip: String,
    pub username: String,
    password: String,
}

impl Target {
    pub fn new(
        device_ip: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            device_ip: device_ip.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    /// Human readable form without the password
    pub fn describe(&self) -> String {
        format!("{}@{}", self.username, self.device_ip)
    }
}

// Manual Debug impl so credentials never reach the logs
impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("device_ip", &self.device_ip)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("listen address {addr} is already in use")]
    AddrInUse { addr: SocketAddr },

    #[error("failed to spawn forwarder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("forwarder exited during startup with {status}: {output}")]
    Exited { status: String, output: String },

    #[error("forwarder did not become ready before the startup timeout")]
    StartupTimeout,

    #[error("forwarder state is unavailable after a panic")]
    StateUnavailable,
}

/// Start/stop/liveness primitives of the forwarding process
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProxyController: Send + Sync {
    /// Start forwarding `listen` to `target`. Implementations enforce their own
    /// startup timeout.
    async fn start(&self, target: &Target, listen: SocketAddr) -> Result<(), ProxyError>;

    /// Stop the forwarder. Safe to call when nothing is running.
    async fn close(&self);

    fn is_alive(&self) -> bool;
}
