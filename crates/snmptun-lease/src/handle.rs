//! Scoped lease handle
//!
//! A [`LeaseHandle`] names the local address to send SNMP traffic to and
//! releases its lease when the last clone is dropped. Release is idempotent,
//! so an explicit `release()` followed by the drop is safe.
//!
//! Each handle remembers the grant it was issued under. Once the same owner
//! leases again, older handles no longer release anything.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::TunnelError;
use crate::manager::TunnelManager;
use crate::registry::LeaseView;

#[derive(Clone)]
pub struct LeaseHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    manager: TunnelManager,
    owner_id: String,
    grant: u64,
    host: IpAddr,
    port: u16,
    released: AtomicBool,
}

impl LeaseHandle {
    pub(crate) fn new(
        manager: TunnelManager,
        owner_id: &str,
        grant: u64,
        host: IpAddr,
        port: u16,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                manager,
                owner_id: owner_id.to_string(),
                grant,
                host,
                port,
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.inner.owner_id
    }

    pub fn host(&self) -> IpAddr {
        self.inner.host
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Local address the SNMP client should talk to
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.inner.host, self.inner.port)
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    /// Extend the lease. Returns false if it already expired or was released.
    pub async fn renew(&self, ttl: Option<Duration>) -> bool {
        self.inner.manager.heartbeat(&self.inner.owner_id, ttl).await
    }

    /// Release the lease. Only the first call (across all clones) has an
    /// effect, and none if the owner has been granted the lease again
    /// through another handle.
    pub async fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner
            .manager
            .release_grant(&self.inner.owner_id, self.inner.grant)
            .await;
    }

    /// Stop this handle from releasing the lease on drop. The lease then
    /// lives until released through the manager or until its TTL lapses.
    pub fn detach(&self) {
        self.inner.released.store(true, Ordering::SeqCst);
    }

    pub async fn info(&self) -> Result<LeaseView, TunnelError> {
        self.inner.manager.lease_info(&self.inner.owner_id).await
    }
}

impl std::fmt::Debug for LeaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseHandle")
            .field("owner_id", &self.inner.owner_id)
            .field("grant", &self.inner.grant)
            .field("addr", &self.addr())
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                debug!(owner_id = %self.owner_id, "Lease handle dropped, releasing");
                let manager = self.manager.clone();
                let owner_id = std::mem::take(&mut self.owner_id);
                let grant = self.grant;
                runtime.spawn(async move {
                    manager.release_grant(&owner_id, grant).await;
                });
            }
            Err(_) => {
                warn!(
                    owner_id = %self.owner_id,
                    "Lease handle dropped outside a runtime; lease left to expire"
                );
            }
        }
    }
}
