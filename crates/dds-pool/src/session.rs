//! Capability contract for one physical DDS session.
//!
//! The wire protocol (framing, message encoding, response decoding) lives in an
//! external client library. The pool only needs the small surface below:
//! connect, disconnect, request, a connectivity flag, and a way to report
//! out-of-band faults.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::slot::SlotId;

/// DDS message types issued by the pool and its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Authenticated hello; carries algorithm, username and password.
    #[serde(rename = "IdAuthHello")]
    AuthHello,
    /// Courtesy notification sent before closing the transport.
    #[serde(rename = "IdGoodbye")]
    Goodbye,
    /// Upload of search criteria for the following retrieval.
    #[serde(rename = "IdCriteria")]
    Criteria,
    /// Extended DCP message block retrieval.
    #[serde(rename = "IdDcpBlockExt")]
    DcpBlockExt,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::AuthHello => "IdAuthHello",
            MessageType::Goodbye => "IdGoodbye",
            MessageType::Criteria => "IdCriteria",
            MessageType::DcpBlockExt => "IdDcpBlockExt",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Session is not connected")]
    Closed,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Slot handle used after its task finished")]
    Expired,
}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        SessionError::Io(e.to_string())
    }
}

/// Server-reported rejection carried by the leading record of a response.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerError {
    /// The `serverCode` as sent; the relay is not consistent about its type.
    pub server_code: serde_json::Value,
    pub explanation: String,
    /// The leading record exactly as received.
    pub raw: serde_json::Value,
}

/// Any code other than null, false, zero or the empty string is an error.
fn is_error_code(code: &serde_json::Value) -> bool {
    match code {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64() != Some(0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
    }
}

/// Decoded response to a single request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Response {
    records: Vec<serde_json::Value>,
}

impl Response {
    pub fn new(records: Vec<serde_json::Value>) -> Self {
        Self { records }
    }

    pub fn data(&self) -> &[serde_json::Value] {
        &self.records
    }

    pub fn into_data(self) -> Vec<serde_json::Value> {
        self.records
    }

    /// Server error reported by the leading record, if any.
    ///
    /// A missing, null, false, zero or empty `serverCode` means success.
    pub fn server_error(&self) -> Option<ServerError> {
        let first = self.records.first()?;
        let code = first.get("serverCode")?;
        if !is_error_code(code) {
            return None;
        }

        let explanation = match first.get("explanation") {
            None | Some(serde_json::Value::Null) => String::new(),
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };

        Some(ServerError {
            server_code: code.clone(),
            explanation,
            raw: first.clone(),
        })
    }
}

/// One physical connection to the relay service.
///
/// Methods take `&self`: the pool guarantees at most one operation in flight
/// per session, so implementations only need interior mutability for their
/// own bookkeeping.
#[async_trait]
pub trait Session: Send + Sync {
    async fn connect(&self) -> Result<(), SessionError>;

    async fn disconnect(&self) -> Result<(), SessionError>;

    async fn request(
        &self,
        message: MessageType,
        payload: Option<serde_json::Value>,
    ) -> Result<Response, SessionError>;

    fn is_connected(&self) -> bool;
}

#[async_trait]
impl<T: Session + ?Sized> Session for Arc<T> {
    async fn connect(&self) -> Result<(), SessionError> {
        (**self).connect().await
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        (**self).disconnect().await
    }

    async fn request(
        &self,
        message: MessageType,
        payload: Option<serde_json::Value>,
    ) -> Result<Response, SessionError> {
        (**self).request(message, payload).await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

/// Asynchronous fault raised by a session outside any pooled task.
#[derive(Debug, Clone)]
pub struct SessionFault {
    pub slot: SlotId,
    pub message: String,
}

/// Slot-tagged sender handed to each session for out-of-band faults.
///
/// Reporting never blocks and never fails the caller: if the monitor is gone
/// or behind, the fault is dropped.
#[derive(Debug, Clone)]
pub struct FaultSender {
    slot: SlotId,
    tx: mpsc::Sender<SessionFault>,
}

impl FaultSender {
    pub(crate) fn new(slot: SlotId, tx: mpsc::Sender<SessionFault>) -> Self {
        Self { slot, tx }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn report(&self, message: impl Into<String>) {
        let fault = SessionFault {
            slot: self.slot,
            message: message.into(),
        };
        if let Err(e) = self.tx.try_send(fault) {
            tracing::debug!(slot = %self.slot, error = %e, "Dropping session fault");
        }
    }
}

/// Builds the session owned by each slot at pool construction.
pub trait SessionFactory: Send + Sync {
    fn create(&self, slot: SlotId, faults: FaultSender) -> Box<dyn Session>;
}

impl<F> SessionFactory for F
where
    F: Fn(SlotId, FaultSender) -> Box<dyn Session> + Send + Sync,
{
    fn create(&self, slot: SlotId, faults: FaultSender) -> Box<dyn Session> {
        self(slot, faults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_error_from_leading_record() {
        let res = Response::new(vec![
            json!({"serverCode": 55, "explanation": "Invalid password"}),
            json!({"ignored": true}),
        ]);

        let err = res.server_error().unwrap();
        assert_eq!(err.server_code, 55);
        assert_eq!(err.explanation, "Invalid password");
        assert_eq!(err.raw["serverCode"], 55);
    }

    #[test]
    fn loosely_typed_codes_are_still_errors() {
        let err = Response::new(vec![json!({"serverCode": "55", "explanation": "Bad user"})])
            .server_error()
            .unwrap();
        assert_eq!(err.server_code, "55");
        assert_eq!(err.explanation, "Bad user");

        let err = Response::new(vec![json!({"serverCode": 55.0})])
            .server_error()
            .unwrap();
        assert_eq!(err.server_code, 55.0);
        assert_eq!(err.explanation, "");

        let err = Response::new(vec![json!({"serverCode": 55, "explanation": 7})])
            .server_error()
            .unwrap();
        assert_eq!(err.explanation, "7");

        assert!(Response::new(vec![json!({"serverCode": true})]).server_error().is_some());
    }

    #[test]
    fn zero_or_missing_code_is_success() {
        assert!(Response::new(vec![json!({"serverCode": 0})]).server_error().is_none());
        assert!(Response::new(vec![json!({"serverCode": 0.0})]).server_error().is_none());
        assert!(Response::new(vec![json!({"serverCode": ""})]).server_error().is_none());
        assert!(Response::new(vec![json!({"serverCode": false})]).server_error().is_none());
        assert!(Response::new(vec![json!({"serverCode": null})]).server_error().is_none());
        assert!(Response::new(vec![json!({"message": {}})]).server_error().is_none());
        assert!(Response::new(vec![json!("not an object")]).server_error().is_none());
        assert!(Response::default().server_error().is_none());
    }

    #[test]
    fn message_type_serializes_protocol_names() {
        insta::assert_json_snapshot!(
            [
                MessageType::AuthHello,
                MessageType::Goodbye,
                MessageType::Criteria,
                MessageType::DcpBlockExt,
            ],
            @r#"
        [
          "IdAuthHello",
          "IdGoodbye",
          "IdCriteria",
          "IdDcpBlockExt"
        ]
        "#
        );
    }

    #[tokio::test]
    async fn fault_sender_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let faults = FaultSender::new(SlotId::new(3), tx);

        faults.report("socket reset");
        faults.report("dropped");

        let fault = rx.recv().await.unwrap();
        assert_eq!(fault.slot, SlotId::new(3));
        assert_eq!(fault.message, "socket reset");
        assert!(rx.try_recv().is_err());
    }
}
