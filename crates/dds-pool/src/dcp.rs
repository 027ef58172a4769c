//! DCP message block retrieval over the pool.
//!
//! A retrieval is two exchanges on the same session: upload the search
//! criteria, then request the extended message block. Both run inside one
//! pooled task so no other caller can swap the criteria in between.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::pool::{Pool, PoolError};
use crate::session::{MessageType, Response};

/// Timestamp layout expected by the relay: year, day of year, time of day.
pub const DDS_TIME_FORMAT: &str = "%Y/%j %H:%M:%S";

/// Search criteria for a DCP retrieval.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DcpCriteria {
    #[serde(skip_serializing_if = "Option::is_none", with = "dds_time")]
    pub drs_since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", with = "dds_time")]
    pub drs_until: Option<DateTime<Utc>>,
    /// Any other criteria keys, passed through unchanged.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl DcpCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn since(mut self, at: DateTime<Utc>) -> Self {
        self.drs_since = Some(at);
        self
    }

    pub fn until(mut self, at: DateTime<Utc>) -> Self {
        self.drs_until = Some(at);
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Criteria as sent on the wire.
    pub fn to_options(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to serialize DCP criteria");
            serde_json::Value::Object(serde_json::Map::new())
        })
    }
}

/// Result of a retrieval: the criteria that were sent and the raw records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DcpBlocks {
    pub criteria_options: serde_json::Value,
    pub response_data: Vec<serde_json::Value>,
}

fn check_response(response: Response) -> Result<Vec<serde_json::Value>, PoolError> {
    match response.server_error() {
        Some(err) => Err(PoolError::Rejected {
            explanation: err.explanation,
            data: err.raw,
        }),
        None => Ok(response.into_data()),
    }
}

/// Fetch the DCP message blocks matching `criteria`.
pub async fn fetch_dcp_blocks(pool: &Pool, criteria: &DcpCriteria) -> Result<DcpBlocks, PoolError> {
    let criteria_options = criteria.to_options();

    pool.execute(|slot| async move {
        let response = slot
            .request(MessageType::Criteria, Some(criteria_options.clone()))
            .await?;
        check_response(response)?;

        let response = slot.request(MessageType::DcpBlockExt, None).await?;
        let response_data = check_response(response)?;

        tracing::debug!(slot = %slot.id(), records = response_data.len(), "Retrieved DCP blocks");

        Ok::<_, PoolError>(DcpBlocks {
            criteria_options,
            response_data,
        })
    })
    .await
}

mod dds_time {
    use chrono::{DateTime, Utc};
    use serde::Serializer;

    use super::DDS_TIME_FORMAT;

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(at) => serializer.collect_str(&at.format(DDS_TIME_FORMAT)),
            None => serializer.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;

    use crate::config::{Credentials, PoolConfig};
    use crate::session::{FaultSender, Session, SessionError};
    use crate::slot::SlotId;
    use crate::testing::{ScriptedSession, pool_of};

    #[test]
    fn criteria_render_day_of_year_timestamps() {
        let criteria = DcpCriteria::new()
            .since(Utc.with_ymd_and_hms(2017, 2, 1, 6, 30, 0).unwrap())
            .until(Utc.with_ymd_and_hms(2017, 2, 1, 7, 0, 59).unwrap())
            .with("dcp_address", json!(["CE1234"]));

        insta::assert_json_snapshot!(criteria.to_options(), @r#"
        {
          "dcp_address": [
            "CE1234"
          ],
          "drs_since": "2017/032 06:30:00",
          "drs_until": "2017/032 07:00:59"
        }
        "#);
    }

    #[test]
    fn empty_criteria_omit_time_bounds() {
        assert_eq!(DcpCriteria::new().to_options(), json!({}));
    }

    #[tokio::test]
    async fn fetch_issues_criteria_then_block_request() {
        let sessions = [ScriptedSession::new()];
        let pool = pool_of(&sessions);
        let criteria = DcpCriteria::new().with("dcp_address", "CE1234");

        let blocks = fetch_dcp_blocks(&pool, &criteria).await.unwrap();

        assert_eq!(blocks.criteria_options, json!({"dcp_address": "CE1234"}));
        assert_eq!(blocks.response_data.len(), 1);
        assert_eq!(blocks.response_data[0]["message"]["body"], "B1");
        assert_eq!(sessions[0].count(MessageType::Criteria), 1);
        assert_eq!(sessions[0].count(MessageType::DcpBlockExt), 1);
    }

    /// Session that rejects every criteria upload.
    struct RejectingCriteria(Arc<ScriptedSession>);

    #[async_trait]
    impl Session for RejectingCriteria {
        async fn connect(&self) -> Result<(), SessionError> {
            self.0.connect().await
        }

        async fn disconnect(&self) -> Result<(), SessionError> {
            self.0.disconnect().await
        }

        async fn request(
            &self,
            message: MessageType,
            payload: Option<serde_json::Value>,
        ) -> Result<Response, SessionError> {
            match message {
                MessageType::Criteria => Ok(Response::new(vec![
                    json!({"serverCode": 12, "explanation": "Invalid criteria"}),
                ])),
                _ => self.0.request(message, payload).await,
            }
        }

        fn is_connected(&self) -> bool {
            self.0.is_connected()
        }
    }

    #[tokio::test]
    async fn server_rejection_surfaces_as_rejected() {
        let inner = ScriptedSession::new();
        let session = Arc::clone(&inner);
        let factory = move |_: SlotId, _: FaultSender| -> Box<dyn Session> {
            Box::new(RejectingCriteria(Arc::clone(&session)))
        };
        let pool = Pool::new(PoolConfig::new(Credentials::new("user", "secret")), &factory);

        let err = fetch_dcp_blocks(&pool, &DcpCriteria::new()).await.unwrap_err();

        match err {
            PoolError::Rejected { explanation, data } => {
                assert_eq!(explanation, "Invalid criteria");
                assert_eq!(data["serverCode"], 12);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(inner.count(MessageType::DcpBlockExt), 0);
        // The session stays authenticated; only the request was refused.
        assert!(pool.slots()[0].is_authenticated());
    }
}
