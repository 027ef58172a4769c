//! Scripted in-memory session for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use crate::config::{Credentials, PoolConfig};
use crate::pool::Pool;
use crate::session::{FaultSender, MessageType, Response, Session, SessionError};
use crate::slot::SlotId;

#[derive(Default)]
pub(crate) struct ScriptedSession {
    connected: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    requests: Mutex<Vec<MessageType>>,
    fail_connect: AtomicBool,
    fail_goodbye: AtomicBool,
    auth_rejection: Mutex<Option<serde_json::Value>>,
    faults: Mutex<Option<FaultSender>>,
}

impl ScriptedSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connected() -> Arc<Self> {
        let session = Self::new();
        session.connected.store(true, Ordering::SeqCst);
        session
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn count(&self, message: MessageType) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|m| **m == message)
            .count()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_goodbye(&self, fail: bool) {
        self.fail_goodbye.store(fail, Ordering::SeqCst);
    }

    pub fn reject_auth(&self, record: Option<serde_json::Value>) {
        *self.auth_rejection.lock().unwrap() = record;
    }

    /// Mark the transport open without going through `connect`.
    pub fn connect_now(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Simulate the remote end closing the socket.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn attach_faults(&self, faults: FaultSender) {
        *self.faults.lock().unwrap() = Some(faults);
    }

    pub fn raise_fault(&self, message: &str) {
        if let Some(faults) = self.faults.lock().unwrap().as_ref() {
            faults.report(message);
        }
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn connect(&self) -> Result<(), SessionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(SessionError::Io("connection refused".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn request(
        &self,
        message: MessageType,
        payload: Option<serde_json::Value>,
    ) -> Result<Response, SessionError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        self.requests.lock().unwrap().push(message);

        match message {
            MessageType::AuthHello => match self.auth_rejection.lock().unwrap().clone() {
                Some(record) => Ok(Response::new(vec![record])),
                None => Ok(Response::new(vec![json!({"serverCode": 0})])),
            },
            MessageType::Goodbye if self.fail_goodbye.load(Ordering::SeqCst) => {
                Err(SessionError::Protocol("goodbye timed out".to_string()))
            }
            MessageType::Goodbye => Ok(Response::default()),
            MessageType::Criteria => Ok(Response::new(vec![json!({"criteria": payload})])),
            MessageType::DcpBlockExt => Ok(Response::new(vec![
                json!({"message": {"header": {"address": "CE1234"}, "body": "B1"}}),
            ])),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Pool with one slot per session, in order.
pub(crate) fn pool_of(sessions: &[Arc<ScriptedSession>]) -> Pool {
    let num_slots = sessions.len();
    let sessions = sessions.to_vec();
    let factory = move |id: SlotId, faults: FaultSender| -> Box<dyn Session> {
        let session = Arc::clone(&sessions[id.index()]);
        session.attach_faults(faults);
        Box::new(session)
    };
    let config = PoolConfig::new(Credentials::new("user", "secret")).with_num_slots(num_slots);
    Pool::new(config, &factory)
}
