//! dds-pool: pooled, authenticated sessions to a GOES DCS DDS relay.

mod config;
mod dcp;
mod grooming;
mod pool;
mod queue;
mod slot;
mod supervisor;
mod telemetry;
#[cfg(test)]
mod testing;

pub mod session;

pub use config::{Credentials, GroomingConfig, PoolConfig};
pub use dcp::{DDS_TIME_FORMAT, DcpBlocks, DcpCriteria, fetch_dcp_blocks};
pub use grooming::{GroomReport, groom_once, idle_slots, spawn_grooming};
pub use pool::{DisconnectFailures, Pool, PoolError, shared_pool};
pub use queue::{QueueTicket, TaskQueue};
pub use session::{
    FaultSender, MessageType, Response, ServerError, Session, SessionError, SessionFactory,
    SessionFault,
};
pub use slot::{AuthData, ReadySlot, Slot, SlotId, SlotSnapshot};
pub use supervisor::PoolSupervisor;
pub use telemetry::init_tracing;
