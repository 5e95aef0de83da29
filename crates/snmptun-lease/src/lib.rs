//! Lease manager for the shared SNMP-over-SSH tunnel
//!
//! Many callers (device probes, test runs, utilities) share one forwarding
//! process that can only target a single device at a time. Callers take
//! time-boxed leases; the forwarder starts with the first lease and stops
//! when the last one is released or expires.
pub mod controller;
pub mod error;
pub mod handle;
mod janitor;
pub mod manager;
pub mod memory;
pub mod port_pool;
pub mod registry;
pub mod tracked;

pub use controller::{ProxyController, ProxyError, Target};
pub use error::{ErrorKind, TunnelError};
pub use handle::LeaseHandle;
pub use janitor::JANITOR_JOIN_TIMEOUT;
pub use manager::{
    TunnelManager, TunnelManagerConfig, DEFAULT_CLEANUP_INTERVAL, DEFAULT_LEASE_TTL,
    DEFAULT_TUNNEL_PORTS,
};
pub use memory::MemoryProxyController;
pub use port_pool::PortPool;
pub use registry::{Lease, LeaseRegistry, LeaseView};
pub use tracked::TunnelService;
