//! In-process stand-in for the SNMP forwarder
//!
//! Binds a real UDP socket on the listen address so that port occupancy is
//! visible to the port pool, but forwards nothing. Used for dry runs and
//! tests.

use async_trait::async_trait;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::controller::{ProxyController, ProxyError, Target};

#[derive(Default)]
pub struct MemoryProxyController {
    running: Mutex<Option<Running>>,
    starts: AtomicUsize,
    closes: AtomicUsize,
}

struct Running {
    target: Target,
    listen: SocketAddr,
    _socket: UdpSocket,
}

impl MemoryProxyController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful starts so far
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of close calls that stopped a running forwarder
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn current_target(&self) -> Option<Target> {
        self.running
            .lock()
            .ok()
            .and_then(|running| running.as_ref().map(|r| r.target.clone()))
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .ok()
            .and_then(|running| running.as_ref().map(|r| r.listen))
    }

    /// Simulate the forwarder dying on its own
    pub fn kill(&self) {
        if let Ok(mut running) = self.running.lock() {
            running.take();
        }
    }
}

#[async_trait]
impl ProxyController for MemoryProxyController {
    async fn start(&self, target: &Target, listen: SocketAddr) -> Result<(), ProxyError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        // Free the previous socket before binding again
        running.take();

        let socket = UdpSocket::bind(listen).map_err(|e| match e.kind() {
            std::io::ErrorKind::AddrInUse => ProxyError::AddrInUse { addr: listen },
            _ => ProxyError::Spawn(e),
        })?;

        info!("In-memory forwarder listening on {} for {}", listen, target.describe());
        *running = Some(Running {
            target: target.clone(),
            listen,
            _socket: socket,
        });
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = running.take() {
            debug!("In-memory forwarder on {} stopped", previous.listen);
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_alive(&self) -> bool {
        self.running
            .lock()
            .map(|running| running.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_binds_and_close_frees() {
        let controller = MemoryProxyController::new();
        let target = Target::new("10.0.0.5", "admin", "x");

        let addr = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        controller.start(&target, addr).await.unwrap();

        assert!(controller.is_alive());
        assert_eq!(controller.listen_addr(), Some(addr));
        assert!(UdpSocket::bind(addr).is_err());

        controller.close().await;
        controller.close().await;
        assert!(!controller.is_alive());
        assert_eq!(controller.close_count(), 1);
        assert!(UdpSocket::bind(addr).is_ok());
    }

    #[tokio::test]
    async fn test_start_on_busy_port() {
        let controller = MemoryProxyController::new();
        let target = Target::new("10.0.0.5", "admin", "x");

        let guard = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = guard.local_addr().unwrap();

        let err = controller.start(&target, addr).await.unwrap_err();
        assert!(matches!(err, ProxyError::AddrInUse { .. }));
        assert!(!controller.is_alive());
        assert_eq!(controller.start_count(), 0);
    }
}
