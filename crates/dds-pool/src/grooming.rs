//! Idle-session grooming.
//!
//! A background loop that periodically disconnects sessions whose last
//! successful task is older than the configured lifetime. Slots that were
//! never active since their last disconnect are left alone.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::GroomingConfig;
use crate::pool::{Pool, PoolError};
use crate::slot::{Slot, SlotId};

/// Outcome of a single grooming run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroomReport {
    /// Slots selected for disconnection, in id order.
    pub groomed: Vec<SlotId>,
}

/// Slots whose last activity is strictly before `now - lifetime`.
pub fn idle_slots(pool: &Pool, lifetime: Duration, now: DateTime<Utc>) -> Vec<Arc<Slot>> {
    let Ok(lifetime) = chrono::Duration::from_std(lifetime) else {
        return Vec::new();
    };
    let Some(cutoff) = now.checked_sub_signed(lifetime) else {
        return Vec::new();
    };

    pool.slots()
        .iter()
        .filter(|slot| slot.last_active_at().is_some_and(|at| at < cutoff))
        .cloned()
        .collect()
}

/// Run one grooming pass as of `now`.
pub async fn groom_once(
    pool: &Pool,
    lifetime: Duration,
    now: DateTime<Utc>,
) -> Result<GroomReport, PoolError> {
    let idle = idle_slots(pool, lifetime, now);

    if idle.is_empty() {
        tracing::info!("Grooming: no idle slots found");
        return Ok(GroomReport::default());
    }

    let groomed: Vec<SlotId> = idle.iter().map(|slot| slot.id()).collect();
    tracing::info!(slots = ?groomed, "Grooming: disconnecting idle slots");

    pool.disconnect_slots(&idle).await?;
    Ok(GroomReport { groomed })
}

/// Start the grooming loop.
///
/// Each run is scheduled `config.interval` after the previous one finished.
/// Failures are logged and never stop the loop; only `shutdown` does.
pub fn spawn_grooming(
    pool: Arc<Pool>,
    config: GroomingConfig,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tracing::debug!(interval = ?config.interval, "Grooming: next run scheduled");

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(config.interval) => {}
            }

            tracing::debug!("Grooming: running");
            if let Err(e) = groom_once(&pool, config.lifetime, Utc::now()).await {
                tracing::error!(error = %e, "Grooming run failed");
            }
        }

        tracing::debug!("Grooming loop exiting");
    })
}
