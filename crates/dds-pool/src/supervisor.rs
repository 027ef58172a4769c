//! Background tasks attached to a pool.
//!
//! Owns the two long-running loops a deployed pool needs:
//! - **fault monitor**: drains out-of-band session faults and logs them per slot
//! - **grooming**: disconnects sessions idle past their lifetime
//!
//! Shutdown stops grooming first, then disconnects every slot, so no grooming
//! run can race the final teardown.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::GroomingConfig;
use crate::grooming::spawn_grooming;
use crate::pool::{Pool, PoolError};
use crate::session::SessionFault;

pub struct PoolSupervisor {
    pool: Arc<Pool>,
    shutdown: CancellationToken,
    grooming: JoinHandle<()>,
    fault_monitor: Option<JoinHandle<()>>,
}

impl PoolSupervisor {
    /// Attach the background loops to `pool`.
    ///
    /// The fault stream can only be consumed once; a second supervisor on the
    /// same pool runs grooming only.
    pub fn start(pool: Arc<Pool>, grooming: GroomingConfig) -> Self {
        let shutdown = CancellationToken::new();

        let fault_monitor = match pool.take_faults() {
            Some(rx) => Some(tokio::spawn(monitor_faults(rx, shutdown.clone()))),
            None => {
                tracing::warn!("Session fault stream already taken; faults will not be logged");
                None
            }
        };

        tracing::info!(
            num_slots = pool.slots().len(),
            lifetime = ?grooming.lifetime,
            interval = ?grooming.interval,
            "Starting pool supervisor"
        );
        let grooming = spawn_grooming(Arc::clone(&pool), grooming, shutdown.clone());

        Self {
            pool,
            shutdown,
            grooming,
            fault_monitor,
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Stop background work and disconnect every slot.
    ///
    /// Returns the aggregate disconnect result; the loops are stopped either way.
    pub async fn shutdown(self) -> Result<(), PoolError> {
        self.shutdown.cancel();

        if let Err(e) = self.grooming.await {
            tracing::error!(error = %e, "Grooming task ended abnormally");
        }

        let result = self.pool.disconnect_all().await;

        if let Some(monitor) = self.fault_monitor
            && let Err(e) = monitor.await
        {
            tracing::error!(error = %e, "Fault monitor ended abnormally");
        }

        tracing::info!("Pool supervisor stopped");
        result
    }
}

/// Log out-of-band faults. They never fail a task or force a disconnect:
/// the next task's connect phase notices a dead session on its own.
async fn monitor_faults(mut rx: mpsc::Receiver<SessionFault>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            fault = rx.recv() => match fault {
                Some(SessionFault { slot, message }) => {
                    tracing::warn!(%slot, error = %message, "Session error");
                }
                None => break,
            },
        }
    }

    tracing::debug!("Fault monitor exiting");
}
