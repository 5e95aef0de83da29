use thiserror::Error;

use crate::controller::ProxyError;

/// Coarse classification callers match on to pick a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No candidate port could be bound
    PortsBusy,
    /// Request targets a different device than the active tunnel
    Configuration,
    /// Everything else: invalid input, unknown owner, proxy failures
    Manager,
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("all local ports for the SNMP tunnel are busy (tried {ports:?})")]
    PortsBusy { ports: Vec<u16> },

    #[error("SNMP tunnel already active for a different device: active {active}, requested {requested}")]
    Configuration { active: String, requested: String },

    #[error("owner_id is required")]
    EmptyOwner,

    #[error("lease {0} is not active")]
    UnknownOwner(String),

    #[error("no ports configured for tunnel manager")]
    NoPorts,

    #[error("invalid port {0}: must be within 1-65535")]
    InvalidPort(u16),

    #[error("failed to start SNMP proxy: {0}")]
    ProxyStart(#[source] ProxyError),
}

impl TunnelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::PortsBusy { .. } => ErrorKind::PortsBusy,
            TunnelError::Configuration { .. } => ErrorKind::Configuration,
            TunnelError::EmptyOwner
            | TunnelError::UnknownOwner(_)
            | TunnelError::NoPorts
            | TunnelError::InvalidPort(_)
            | TunnelError::ProxyStart(_) => ErrorKind::Manager,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            TunnelError::PortsBusy { ports: vec![1161] }.kind(),
            ErrorKind::PortsBusy
        );
        assert_eq!(
            TunnelError::Configuration {
                active: "10.0.0.5".to_string(),
                requested: "10.0.0.9".to_string(),
            }
            .kind(),
            ErrorKind::Configuration
        );
        assert_eq!(TunnelError::EmptyOwner.kind(), ErrorKind::Manager);
        assert_eq!(
            TunnelError::ProxyStart(ProxyError::StartupTimeout).kind(),
            ErrorKind::Manager
        );
    }

    #[test]
    fn test_configuration_message_names_devices() {
        let err = TunnelError::Configuration {
            active: "10.0.0.5".to_string(),
            requested: "10.0.0.9".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.5"));
        assert!(msg.contains("10.0.0.9"));
    }
}
