//! Candidate local ports for the SNMP forwarder
//!
//! Availability is checked with a transient UDP bind that is released
//! immediately. The probe is advisory: another process may grab the port
//! between the probe and the forwarder's own bind.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, warn};

use crate::error::TunnelError;

#[derive(Debug, Clone)]
pub struct PortPool {
    ports: Vec<u16>,
}

impl PortPool {
    /// Build a pool from an ordered list. Duplicates are dropped keeping the
    /// first occurrence; an empty list or port 0 is rejected.
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Result<Self, TunnelError> {
        let mut result: Vec<u16> = Vec::new();
        for port in ports {
            if port == 0 {
                return Err(TunnelError::InvalidPort(port));
            }
            if !result.contains(&port) {
                result.push(port);
            }
        }

        if result.is_empty() {
            return Err(TunnelError::NoPorts);
        }

        Ok(Self { ports: result })
    }

    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Pick the port the forwarder should bind to.
    ///
    /// An already active port is reused as is. Otherwise the first candidate
    /// that can currently be bound on `host` wins.
    pub fn select(&self, host: IpAddr, active_port: Option<u16>) -> Result<u16, TunnelError> {
        if let Some(port) = active_port {
            return Ok(port);
        }

        for &port in &self.ports {
            if Self::is_port_available(host, port) {
                debug!("Selected port {} for SNMP tunnel", port);
                return Ok(port);
            }
            debug!("Port {} is busy, trying next candidate", port);
        }

        warn!("All configured tunnel ports are busy: {:?}", self.ports);
        Err(TunnelError::PortsBusy {
            ports: self.ports.clone(),
        })
    }

    /// Check if a port can be bound right now
    pub fn is_port_available(host: IpAddr, port: u16) -> bool {
        let addr = SocketAddr::new(host, port);
        let socket = match Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        {
            Ok(socket) => socket,
            Err(e) => {
                warn!("Failed to create probe socket for {}: {}", addr, e);
                return false;
            }
        };

        if let Err(e) = socket.set_reuse_address(true) {
            warn!("Failed to set SO_REUSEADDR on probe socket: {}", e);
        }

        socket.bind(&addr.into()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, UdpSocket};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn occupied_port() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    fn free_port() -> u16 {
        let (socket, port) = occupied_port();
        drop(socket);
        port
    }

    #[test]
    fn test_new_deduplicates_preserving_order() {
        let pool = PortPool::new([21161, 1161, 21161, 31161, 1161]).unwrap();
        assert_eq!(pool.ports(), &[21161, 1161, 31161]);
    }

    #[test]
    fn test_new_rejects_empty() {
        let err = PortPool::new(Vec::<u16>::new()).unwrap_err();
        assert!(matches!(err, TunnelError::NoPorts));
    }

    #[test]
    fn test_new_rejects_zero() {
        let err = PortPool::new([1161, 0]).unwrap_err();
        assert!(matches!(err, TunnelError::InvalidPort(0)));
    }

    #[test]
    fn test_select_reuses_active_port() {
        let (_guard, busy) = occupied_port();
        let pool = PortPool::new([busy]).unwrap();

        // Active port is returned without probing
        assert_eq!(pool.select(LOCALHOST, Some(busy)).unwrap(), busy);
    }

    #[test]
    fn test_select_skips_busy_ports() {
        let (_guard, busy) = occupied_port();
        let free = free_port();
        let pool = PortPool::new([busy, free]).unwrap();

        assert_eq!(pool.select(LOCALHOST, None).unwrap(), free);
    }

    #[test]
    fn test_select_all_busy() {
        let (_guard1, busy1) = occupied_port();
        let (_guard2, busy2) = occupied_port();
        let pool = PortPool::new([busy1, busy2]).unwrap();

        match pool.select(LOCALHOST, None) {
            Err(TunnelError::PortsBusy { ports }) => assert_eq!(ports, vec![busy1, busy2]),
            other => panic!("expected PortsBusy, got {:?}", other),
        }
    }

    #[test]
    fn test_probe_releases_socket() {
        let port = free_port();
        assert!(PortPool::is_port_available(LOCALHOST, port));
        // The probe must not keep the port bound
        assert!(UdpSocket::bind(("127.0.0.1", port)).is_ok());
    }
}
