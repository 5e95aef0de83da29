//! Background sweep of expired leases

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::manager::{Shared, TunnelManager};

/// Upper bound for waiting on the janitor task at shutdown
pub const JANITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct Janitor {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Janitor {
    /// Spawn the sweep loop. Only a weak reference to the manager is kept, so
    /// the loop ends by itself once the manager is gone.
    pub(crate) fn spawn(manager: Weak<Shared>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(shared) = manager.upgrade() else {
                    debug!("Tunnel manager dropped, janitor exiting");
                    break;
                };
                let manager = TunnelManager::from_shared(shared);

                match AssertUnwindSafe(manager.sweep_expired()).catch_unwind().await {
                    Ok(0) => {}
                    Ok(evicted) => debug!("Janitor evicted {} expired lease(s)", evicted),
                    Err(_) => error!("Janitor sweep panicked; retrying on next tick"),
                }
            }
        });

        info!("Lease janitor started (sweeps every {:?})", interval);

        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Cancel the loop and wait for it, at most [`JANITOR_JOIN_TIMEOUT`]
    pub(crate) async fn stop(mut self) {
        self.cancel.cancel();

        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            match tokio::time::timeout(JANITOR_JOIN_TIMEOUT, task).await {
                Ok(_) => debug!("Lease janitor stopped"),
                Err(_) => {
                    warn!("Lease janitor did not stop in time, aborting it");
                    abort.abort();
                }
            }
        }
    }
}

impl Drop for Janitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
