//! Fixed-size pool of DDS sessions.
//!
//! Work is routed to the least-loaded slot, preferring slots whose session is
//! already connected, and runs behind that slot's serialized queue. Sessions
//! connect and authenticate lazily the first time a task needs them.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};

use tokio::sync::mpsc;

use crate::config::PoolConfig;
use crate::session::{FaultSender, SessionError, SessionFactory, SessionFault};
use crate::slot::{ReadySlot, Slot, SlotId, SlotSnapshot};

/// Capacity of the out-of-band fault channel shared by all slots.
const FAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("No slots available")]
    NoSlotsAvailable,
    #[error("Connection failed: {0}")]
    Connect(#[source] SessionError),
    #[error("Not authenticated: {explanation}")]
    NotAuthenticated {
        explanation: String,
        data: serde_json::Value,
    },
    #[error("Request rejected: {explanation}")]
    Rejected {
        explanation: String,
        data: serde_json::Value,
    },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Disconnect(#[from] DisconnectFailures),
}

/// Per-slot failures collected from a bulk disconnect.
///
/// Every requested slot was still disconnected and cleaned up; these are the
/// ones whose goodbye or close reported an error along the way.
#[derive(Debug, thiserror::Error)]
#[error("{} slot(s) failed to disconnect cleanly", .failures.len())]
pub struct DisconnectFailures {
    pub failures: Vec<(SlotId, SessionError)>,
}

pub struct Pool {
    config: PoolConfig,
    slots: Vec<Arc<Slot>>,
    /// Serializes slot selection with ticket reservation.
    scheduler: StdMutex<()>,
    faults: StdMutex<Option<mpsc::Receiver<SessionFault>>>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("slots", &self.slots)
            .finish()
    }
}

impl Pool {
    /// Build every slot up front; the set never grows or shrinks afterwards.
    pub fn new(config: PoolConfig, factory: &dyn SessionFactory) -> Self {
        let (fault_tx, fault_rx) = mpsc::channel(FAULT_CHANNEL_CAPACITY);

        let slots = (0..config.num_slots)
            .map(|index| {
                let id = SlotId::new(index);
                let session = factory.create(id, FaultSender::new(id, fault_tx.clone()));
                Arc::new(Slot::new(id, session))
            })
            .collect();

        tracing::debug!(num_slots = config.num_slots, "Created session pool");

        Self {
            config,
            slots,
            scheduler: StdMutex::new(()),
            faults: StdMutex::new(Some(fault_rx)),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// All slots in id order. These are read-only views; requests go through
    /// the [`ReadySlot`] handed to an `execute` callback.
    pub fn slots(&self) -> &[Arc<Slot>] {
        &self.slots
    }

    pub fn snapshot(&self) -> Vec<SlotSnapshot> {
        self.slots.iter().map(|slot| slot.snapshot()).collect()
    }

    /// Slots ranked for new work: shallowest queue first, connected before
    /// disconnected on ties. Recomputed on every call.
    pub fn priority_slots(&self) -> Vec<Arc<Slot>> {
        let mut ranked: Vec<(usize, bool, Arc<Slot>)> = self
            .slots
            .iter()
            .map(|slot| (slot.queue_depth(), !slot.is_connected(), Arc::clone(slot)))
            .collect();
        ranked.sort_by_key(|(depth, disconnected, _)| (*depth, *disconnected));
        ranked.into_iter().map(|(_, _, slot)| slot).collect()
    }

    pub fn priority_slot(&self) -> Option<Arc<Slot>> {
        self.priority_slots().into_iter().next()
    }

    /// Run `callback` against a ready slot.
    ///
    /// The chosen slot is connected and authenticated first if needed. The
    /// callback's own result or error is returned as is; pool failures are
    /// converted into the caller's error type. Nothing is retried.
    ///
    /// The [`ReadySlot`] stops accepting requests once the callback's future
    /// completes.
    ///
    /// The callback must not submit more work to the pool and wait on it: it
    /// holds its slot's queue for its whole duration.
    pub async fn execute<F, Fut, R, E>(&self, callback: F) -> Result<R, E>
    where
        F: FnOnce(ReadySlot) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<PoolError>,
    {
        let (slot, ticket) = {
            let _scheduling = self
                .scheduler
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let slot = self.priority_slot().ok_or(PoolError::NoSlotsAvailable)?;
            let ticket = slot.reserve();
            (slot, ticket)
        };

        tracing::info!(slot = %slot.id(), queue_depth = slot.queue_depth(), "Enqueuing task");

        slot.execute(ticket, &self.config.credentials, callback)
            .await
    }

    /// Disconnect every slot.
    pub async fn disconnect_all(&self) -> Result<(), PoolError> {
        self.disconnect_slots(&self.slots).await
    }

    /// Disconnect the given slots.
    ///
    /// Each slot's activity stamp is cleared immediately; the disconnect itself
    /// waits behind any task already queued on that slot. Failures on one slot
    /// never keep the others from disconnecting.
    pub async fn disconnect_slots(&self, slots: &[Arc<Slot>]) -> Result<(), PoolError> {
        let pending: Vec<_> = slots
            .iter()
            .map(|slot| {
                slot.clear_last_active();
                let ticket = slot.reserve();
                async move { (slot.id(), slot.disconnect(ticket).await) }
            })
            .collect();

        let failures: Vec<(SlotId, SessionError)> = futures::future::join_all(pending)
            .await
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            for (id, e) in &failures {
                tracing::warn!(slot = %id, error = %e, "Slot did not disconnect cleanly");
            }
            Err(DisconnectFailures { failures }.into())
        }
    }

    /// Hand over the out-of-band fault stream. Returns `None` once taken.
    pub(crate) fn take_faults(&self) -> Option<mpsc::Receiver<SessionFault>> {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

static SHARED_POOL: OnceLock<Arc<Pool>> = OnceLock::new();

/// Process-wide pool for the composition root.
///
/// `init` runs only on the first call; later calls return the same pool.
/// Library code should take an `Arc<Pool>` rather than reaching for this.
pub fn shared_pool(init: impl FnOnce() -> Pool) -> Arc<Pool> {
    Arc::clone(SHARED_POOL.get_or_init(|| Arc::new(init())))
}
