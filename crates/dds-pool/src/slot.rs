//! Slot: one pooled session, its serialized queue, and cached session state.
//!
//! All mutation of `auth_data` and `last_active_at` happens inside the slot's
//! own queue. The one exception is `Pool::disconnect_slots`, which clears
//! `last_active_at` before enqueuing the disconnect so grooming cannot pick the
//! same slot twice.

use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Credentials;
use crate::pool::PoolError;
use crate::queue::{QueueTicket, TaskQueue};
use crate::session::{MessageType, Response, Session, SessionError};

/// Stable index of a slot within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SlotId(usize);

impl SlotId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of a successful authenticate exchange.
///
/// Holding it means the session may issue requests without authenticating
/// again. It is dropped whenever the session disconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthData(Vec<serde_json::Value>);

impl AuthData {
    pub fn records(&self) -> &[serde_json::Value] {
        &self.0
    }
}

/// Point-in-time view of a slot for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotSnapshot {
    pub id: SlotId,
    pub connected: bool,
    pub queue_depth: usize,
    pub authenticated: bool,
    pub last_active_at: Option<DateTime<Utc>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Slot {
    id: SlotId,
    session: Box<dyn Session>,
    queue: TaskQueue,
    auth_data: StdMutex<Option<AuthData>>,
    last_active_at: StdMutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .field("queue_depth", &self.queue_depth())
            .field("authenticated", &self.is_authenticated())
            .field("last_active_at", &self.last_active_at())
            .finish()
    }
}

impl Slot {
    pub(crate) fn new(id: SlotId, session: Box<dyn Session>) -> Self {
        Self {
            id,
            session,
            queue: TaskQueue::new(),
            auth_data: StdMutex::new(None),
            last_active_at: StdMutex::new(None),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn auth_data(&self) -> Option<AuthData> {
        lock(&self.auth_data).clone()
    }

    pub fn is_authenticated(&self) -> bool {
        lock(&self.auth_data).is_some()
    }

    /// When a task last reached the ready phase, or `None` since the last disconnect.
    pub fn last_active_at(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_active_at)
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        SlotSnapshot {
            id: self.id,
            connected: self.is_connected(),
            queue_depth: self.queue_depth(),
            authenticated: self.is_authenticated(),
            last_active_at: self.last_active_at(),
        }
    }

    pub(crate) fn reserve(&self) -> QueueTicket {
        self.queue.reserve()
    }

    pub(crate) fn clear_last_active(&self) {
        *lock(&self.last_active_at) = None;
    }

    #[cfg(test)]
    pub(crate) fn set_last_active_at(&self, at: DateTime<Utc>) {
        *lock(&self.last_active_at) = Some(at);
    }

    fn clear_session_state(&self) {
        *lock(&self.auth_data) = None;
        *lock(&self.last_active_at) = None;
    }

    /// Run the connect → authenticate → execute pipeline once this ticket's
    /// turn comes up.
    pub(crate) async fn execute<F, Fut, R, E>(
        self: &Arc<Self>,
        ticket: QueueTicket,
        credentials: &Credentials,
        callback: F,
    ) -> Result<R, E>
    where
        F: FnOnce(ReadySlot) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<PoolError>,
    {
        self.queue
            .run(ticket, || async move {
                self.ensure_ready(credentials).await?;
                *lock(&self.last_active_at) = Some(Utc::now());

                let ready = ReadySlot::new(Arc::clone(self));
                let _expire = ExpireOnDrop(Arc::clone(&ready.live));
                callback(ready).await
            })
            .await
    }

    async fn ensure_ready(&self, credentials: &Credentials) -> Result<(), PoolError> {
        let was_connected = self.session.is_connected();

        if !was_connected {
            // A closed transport never keeps its authentication.
            *lock(&self.auth_data) = None;

            tracing::info!(slot = %self.id, "Connecting");
            self.session.connect().await.map_err(PoolError::Connect)?;
        }

        if was_connected && self.is_authenticated() {
            return Ok(());
        }

        let response = self
            .session
            .request(MessageType::AuthHello, Some(credentials.auth_payload()))
            .await
            .map_err(PoolError::Session)?;

        if let Some(err) = response.server_error() {
            tracing::warn!(
                slot = %self.id,
                server_code = %err.server_code,
                explanation = %err.explanation,
                "Authentication rejected"
            );
            return Err(PoolError::NotAuthenticated {
                explanation: err.explanation,
                data: err.raw,
            });
        }

        tracing::info!(slot = %self.id, "Connected and authorized");
        *lock(&self.auth_data) = Some(AuthData(response.into_data()));
        Ok(())
    }

    /// Run the goodbye → close → cleanup pipeline once this ticket's turn comes up.
    ///
    /// Cleanup always runs. The first failure, if any, is still returned.
    pub(crate) async fn disconnect(&self, ticket: QueueTicket) -> Result<(), SessionError> {
        self.queue
            .run(ticket, || async {
                let result = self.say_goodbye().await;
                self.clear_session_state();
                result
            })
            .await
    }

    async fn say_goodbye(&self) -> Result<(), SessionError> {
        if !self.session.is_connected() {
            return Ok(());
        }

        tracing::info!(slot = %self.id, "Disconnecting");

        let goodbye = self.session.request(MessageType::Goodbye, None).await;
        if let Err(ref e) = goodbye {
            tracing::warn!(slot = %self.id, error = %e, "Goodbye failed; closing anyway");
        }

        let closed = self.session.disconnect().await;
        if let Err(ref e) = closed {
            tracing::warn!(slot = %self.id, error = %e, "Disconnect failed");
        }

        goodbye.map(|_| ()).and(closed)
    }
}

/// A connected, authenticated slot handed to a pooled callback.
///
/// Requests are accepted only while the callback's task holds the slot's
/// queue. A handle kept past that point answers every request with
/// [`SessionError::Expired`].
#[derive(Debug, Clone)]
pub struct ReadySlot {
    slot: Arc<Slot>,
    live: Arc<AtomicBool>,
}

impl ReadySlot {
    fn new(slot: Arc<Slot>) -> Self {
        Self {
            slot,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Issue a request on this slot's session.
    pub async fn request(
        &self,
        message: MessageType,
        payload: Option<serde_json::Value>,
    ) -> Result<Response, SessionError> {
        if !self.is_live() {
            return Err(SessionError::Expired);
        }
        self.slot.session.request(message, payload).await
    }
}

impl Deref for ReadySlot {
    type Target = Slot;

    fn deref(&self) -> &Slot {
        &self.slot
    }
}

struct ExpireOnDrop(Arc<AtomicBool>);

impl Drop for ExpireOnDrop {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
