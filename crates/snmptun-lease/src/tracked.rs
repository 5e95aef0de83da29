//! Tracked reservations: "my current lease for purpose X"
//!
//! Each tracking key owns at most one lease. Reserving again under the same
//! key installs the new lease first and only then releases the superseded
//! one, so the tunnel never drains in between.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::controller::Target;
use crate::error::TunnelError;
use crate::handle::LeaseHandle;
use crate::manager::TunnelManager;
use crate::registry::LeaseView;

pub struct TunnelService {
    manager: TunnelManager,
    tracked: Mutex<HashMap<String, LeaseHandle>>,
}

impl TunnelService {
    pub fn new(manager: TunnelManager) -> Self {
        Self {
            manager,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &TunnelManager {
        &self.manager
    }

    /// Reserve the tunnel for `tracking_key`.
    ///
    /// With `track`, the lease gets its own owner id and replaces whatever
    /// was tracked under the key. Without it, the key itself is the owner id
    /// and the caller is responsible for the returned handle.
    pub async fn reserve(
        &self,
        tracking_key: &str,
        owner_kind: &str,
        target: Target,
        ttl: Option<Duration>,
        track: bool,
    ) -> Result<LeaseHandle, TunnelError> {
        if tracking_key.trim().is_empty() {
            return Err(TunnelError::EmptyOwner);
        }

        if !track {
            return self.manager.lease(tracking_key, owner_kind, target, ttl).await;
        }

        // Held across the whole swap; serialises tracked reservations for all keys
        let mut tracked = self.tracked.lock().await;

        let owner_id = format!("{}#{}", tracking_key, Uuid::new_v4().simple());
        let lease = self.manager.lease(&owner_id, owner_kind, target, ttl).await?;

        if let Some(previous) = tracked.insert(tracking_key.to_string(), lease.clone()) {
            if previous.owner_id() != lease.owner_id() {
                info!(
                    tracking_key = %tracking_key,
                    previous = %previous.owner_id(),
                    current = %lease.owner_id(),
                    "Superseding tracked tunnel lease"
                );
                previous.release().await;
            }
        }

        Ok(lease)
    }

    /// Release whatever is tracked under `tracking_key`. Falls back to
    /// releasing `tracking_key` as a plain owner id.
    pub async fn release(&self, tracking_key: &str) {
        let lease = self.tracked.lock().await.remove(tracking_key);

        match lease {
            Some(lease) => {
                debug!(tracking_key = %tracking_key, "Releasing tracked lease");
                lease.release().await;
            }
            None => {
                self.manager.release(tracking_key).await;
            }
        }
    }

    /// Renew the lease behind `tracking_key` (tracked or plain)
    pub async fn heartbeat(&self, tracking_key: &str, ttl: Option<Duration>) -> bool {
        let lease = self.tracked.lock().await.get(tracking_key).cloned();

        match lease {
            Some(lease) => lease.renew(ttl).await,
            None => self.manager.heartbeat(tracking_key, ttl).await,
        }
    }

    /// Owner id currently tracked under `tracking_key`
    pub async fn tracked_owner(&self, tracking_key: &str) -> Option<String> {
        self.tracked
            .lock()
            .await
            .get(tracking_key)
            .map(|lease| lease.owner_id().to_string())
    }

    pub fn tunnel_alive(&self) -> bool {
        self.manager.tunnel_alive()
    }

    pub async fn describe(&self) -> Vec<LeaseView> {
        self.manager.active_leases().await
    }
}
