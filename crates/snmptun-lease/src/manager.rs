//! Tunnel manager: multiplexes leases over a single SNMP forwarder
//!
//! The manager is either idle (no leases, forwarder stopped, no target) or
//! active (at least one lease, forwarder running for one fixed target). The
//! first lease starts the forwarder, the removal of the last lease tears it
//! down. A lease for a different target while active is rejected.

use chrono::Utc;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::controller::{ProxyController, ProxyError, Target};
use crate::error::TunnelError;
use crate::handle::LeaseHandle;
use crate::janitor::Janitor;
use crate::port_pool::PortPool;
use crate::registry::{Lease, LeaseRegistry, LeaseView};

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_TUNNEL_PORTS: [u16; 3] = [1161, 21161, 31161];

#[derive(Debug, Clone)]
pub struct TunnelManagerConfig {
    /// Host the forwarder listens on
    pub listen_host: IpAddr,
    /// Candidate listen ports, in order of preference
    pub ports: Vec<u16>,
    /// TTL applied when a caller does not specify one
    pub default_ttl: Duration,
    /// How often the janitor sweeps expired leases
    pub cleanup_interval: Duration,
}

impl Default for TunnelManagerConfig {
    fn default() -> Self {
        Self {
            listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports: DEFAULT_TUNNEL_PORTS.to_vec(),
            default_ttl: DEFAULT_LEASE_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

/// Everything guarded by the manager lock
#[derive(Debug, Default)]
struct TunnelState {
    registry: LeaseRegistry,
    active_port: Option<u16>,
    target: Option<Target>,
}

pub(crate) struct Shared {
    controller: Arc<dyn ProxyController>,
    pool: PortPool,
    listen_host: IpAddr,
    default_ttl: Duration,
    state: Mutex<TunnelState>,
    janitor: StdMutex<Option<Janitor>>,
}

/// Cheap to clone; all clones drive the same forwarder and registry
#[derive(Clone)]
pub struct TunnelManager {
    shared: Arc<Shared>,
}

impl TunnelManager {
    /// Create the manager and start its janitor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        controller: Arc<dyn ProxyController>,
        config: TunnelManagerConfig,
    ) -> Result<Self, TunnelError> {
        let pool = PortPool::new(config.ports)?;

        info!(
            "Creating tunnel manager on {} with ports {:?}",
            config.listen_host,
            pool.ports()
        );

        let shared = Arc::new(Shared {
            controller,
            pool,
            listen_host: config.listen_host,
            default_ttl: if config.default_ttl.is_zero() {
                DEFAULT_LEASE_TTL
            } else {
                config.default_ttl
            },
            state: Mutex::new(TunnelState::default()),
            janitor: StdMutex::new(None),
        });

        let interval = if config.cleanup_interval.is_zero() {
            DEFAULT_CLEANUP_INTERVAL
        } else {
            config.cleanup_interval
        };
        let janitor = Janitor::spawn(Arc::downgrade(&shared), interval);
        if let Ok(mut slot) = shared.janitor.lock() {
            *slot = Some(janitor);
        }

        Ok(Self { shared })
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn listen_host(&self) -> IpAddr {
        self.shared.listen_host
    }

    pub fn configured_ports(&self) -> &[u16] {
        self.shared.pool.ports()
    }

    pub fn default_ttl(&self) -> Duration {
        self.shared.default_ttl
    }

    /// Acquire (or renew) the lease of `owner_id` on the tunnel to `target`.
    ///
    /// Renewing an existing owner never touches the forwarder. A new owner
    /// starts the forwarder if it is not running; while active, only the
    /// current target is accepted.
    pub async fn lease(
        &self,
        owner_id: &str,
        owner_kind: &str,
        target: Target,
        ttl: Option<Duration>,
    ) -> Result<LeaseHandle, TunnelError> {
        if owner_id.trim().is_empty() {
            return Err(TunnelError::EmptyOwner);
        }

        let ttl = ttl
            .filter(|ttl| !ttl.is_zero())
            .unwrap_or(self.shared.default_ttl);

        let mut state = self.shared.state.lock().await;
        let now = Utc::now();
        self.sweep_locked(&mut state, now).await;

        if let Some(current) = &state.target {
            if current != &target {
                warn!(
                    owner_id = %owner_id,
                    active = %current.describe(),
                    requested = %target.describe(),
                    "Rejected lease for a different device"
                );
                return Err(TunnelError::Configuration {
                    active: current.describe(),
                    requested: target.describe(),
                });
            }
        }

        if let Some(grant) = state.registry.regrant(owner_id, Some(ttl), now) {
            let port = state.active_port.unwrap_or_default();
            debug!(owner_id = %owner_id, port, grant, "Renewed existing lease");
            return Ok(self.handle(owner_id, port, grant));
        }

        let port = self.ensure_proxy(&mut state, &target).await?;
        let grant = state
            .registry
            .insert(Lease::new(owner_id, owner_kind, port, &target, ttl, now));

        info!(
            owner_id = %owner_id,
            owner_kind = %owner_kind,
            port,
            device_ip = %target.device_ip,
            active_leases = state.registry.len(),
            "Granted tunnel lease"
        );

        Ok(self.handle(owner_id, port, grant))
    }

    fn handle(&self, owner_id: &str, port: u16, grant: u64) -> LeaseHandle {
        LeaseHandle::new(self.clone(), owner_id, grant, self.shared.listen_host, port)
    }

    /// Run `f` while holding a lease; the lease is released whatever `f`
    /// returns.
    pub async fn with_lease<F, Fut, T, E>(
        &self,
        owner_id: &str,
        owner_kind: &str,
        target: Target,
        ttl: Option<Duration>,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce(LeaseHandle) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<TunnelError>,
    {
        let lease = self.lease(owner_id, owner_kind, target, ttl).await?;
        let result = f(lease.clone()).await;
        lease.release().await;
        result
    }

    /// Make sure the forwarder runs for `target` and return its port.
    /// The caller has already checked `target` against the active one.
    async fn ensure_proxy(
        &self,
        state: &mut TunnelState,
        target: &Target,
    ) -> Result<u16, TunnelError> {
        if let Some(port) = state.active_port {
            if self.shared.controller.is_alive() {
                state.target = Some(target.clone());
                return Ok(port);
            }
            warn!(port, "SNMP proxy is not alive, restarting it");
        }

        let port = self.shared.pool.select(self.shared.listen_host, state.active_port)?;
        let listen = SocketAddr::new(self.shared.listen_host, port);

        info!(
            device_ip = %target.device_ip,
            username = %target.username,
            listen = %listen,
            "Starting SNMP proxy"
        );

        if let Err(e) = self.shared.controller.start(target, listen).await {
            warn!("Failed to start SNMP proxy on {}: {}", listen, e);
            if state.registry.is_empty() {
                self.teardown_locked(state).await;
            }
            return Err(match e {
                ProxyError::AddrInUse { .. } => TunnelError::PortsBusy {
                    ports: self.shared.pool.ports().to_vec(),
                },
                other => TunnelError::ProxyStart(other),
            });
        }

        state.active_port = Some(port);
        state.target = Some(target.clone());
        Ok(port)
    }

    /// Push out the expiry of an existing lease. Unknown owners are ignored
    /// so that a heartbeat racing with expiry cannot resurrect a lease.
    pub async fn heartbeat(&self, owner_id: &str, ttl: Option<Duration>) -> bool {
        let ttl = ttl.filter(|ttl| !ttl.is_zero());
        let mut state = self.shared.state.lock().await;
        let renewed = state.registry.renew(owner_id, ttl, Utc::now());

        if renewed {
            debug!(owner_id = %owner_id, "Lease heartbeat");
        } else {
            debug!(owner_id = %owner_id, "Heartbeat for unknown lease ignored");
        }

        renewed
    }

    /// Drop the lease of `owner_id`. Idempotent; returns whether a lease was
    /// actually removed.
    pub async fn release(&self, owner_id: &str) -> bool {
        self.release_matching(owner_id, None).await
    }

    /// Drop the lease of `owner_id` only if it is still held under `grant`.
    /// A lease granted again since then is left alone.
    pub(crate) async fn release_grant(&self, owner_id: &str, grant: u64) -> bool {
        self.release_matching(owner_id, Some(grant)).await
    }

    async fn release_matching(&self, owner_id: &str, grant: Option<u64>) -> bool {
        let mut state = self.shared.state.lock().await;

        let removed = match grant {
            Some(grant) => state.registry.remove_grant(owner_id, grant),
            None => state.registry.remove(owner_id),
        };

        if removed.is_none() {
            debug!(owner_id = %owner_id, ?grant, "Release of unknown or superseded lease ignored");
            return false;
        }

        info!(
            owner_id = %owner_id,
            remaining = state.registry.len(),
            "Released tunnel lease"
        );

        if state.registry.is_empty() {
            self.teardown_locked(&mut state).await;
        }

        true
    }

    /// Snapshot of all live leases, after evicting expired ones
    pub async fn active_leases(&self) -> Vec<LeaseView> {
        let mut state = self.shared.state.lock().await;
        self.sweep_locked(&mut state, Utc::now()).await;
        state.registry.snapshot()
    }

    /// View of one live lease, after evicting expired ones
    pub async fn lease_info(&self, owner_id: &str) -> Result<LeaseView, TunnelError> {
        let mut state = self.shared.state.lock().await;
        self.sweep_locked(&mut state, Utc::now()).await;
        state
            .registry
            .get(owner_id)
            .map(Lease::view)
            .ok_or_else(|| TunnelError::UnknownOwner(owner_id.to_string()))
    }

    pub async fn active_port(&self) -> Option<u16> {
        self.shared.state.lock().await.active_port
    }

    /// Whether the forwarder process is running, independent of the registry
    pub fn tunnel_alive(&self) -> bool {
        self.shared.controller.is_alive()
    }

    /// Evict expired leases; tears the forwarder down if none remain.
    /// Returns the number of evicted leases.
    pub async fn sweep_expired(&self) -> usize {
        let mut state = self.shared.state.lock().await;
        self.sweep_locked(&mut state, Utc::now()).await
    }

    async fn sweep_locked(&self, state: &mut TunnelState, now: chrono::DateTime<Utc>) -> usize {
        let expired = state.registry.remove_expired(now);

        for lease in &expired {
            info!(
                owner_id = %lease.owner_id,
                owner_kind = %lease.owner_kind,
                expired_at = %lease.expires_at,
                "Reclaimed expired tunnel lease"
            );
        }

        if !expired.is_empty() && state.registry.is_empty() {
            self.teardown_locked(state).await;
        }

        expired.len()
    }

    /// Return to idle. State is cleared before the forwarder is closed.
    async fn teardown_locked(&self, state: &mut TunnelState) {
        let port = state.active_port.take();
        state.target = None;

        if let Some(port) = port {
            info!(port, "No active leases left, stopping SNMP proxy");
        }
        self.shared.controller.close().await;
    }

    /// Stop the janitor, drop every lease and stop the forwarder.
    pub async fn shutdown(&self) {
        let janitor = self
            .shared
            .janitor
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());

        if let Some(janitor) = janitor {
            janitor.stop().await;
        }

        let mut state = self.shared.state.lock().await;
        let dropped = state.registry.len();
        state.registry = LeaseRegistry::new();
        self.teardown_locked(&mut state).await;

        info!(dropped_leases = dropped, "Tunnel manager shut down");
    }
}
