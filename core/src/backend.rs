/// Backend access: REST wire records and the transport seam
///
/// The gym backend is opaque to the engines; everything they need is behind
/// the `MessageBackend` trait so tests can script a backend in memory.
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::session::Session;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A confirmed message, normalized from any backend endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMessage {
    pub id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
}

/// Record shape of `GET /chat/trainer/{id}/` (member conversation snapshot)
#[derive(Debug, Deserialize)]
struct ConversationRecord {
    id: i64,
    message: String,
    sender: i64,
    timestamp: DateTime<Utc>,
}

/// Record shape of `GET /trainer/{id}/messages/` (trainer inbox, incremental)
#[derive(Debug, Deserialize)]
struct InboxRecord {
    id: i64,
    sender: i64,
    receiver: i64,
    message: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    is_read: bool,
}

/// Body of `POST /messages/send/`
#[derive(Debug, Serialize)]
struct SendPayload<'a> {
    sender_id: i64,
    receiver_id: i64,
    message: &'a str,
}

impl From<InboxRecord> for RemoteMessage {
    fn from(r: InboxRecord) -> Self {
        Self {
            id: r.id,
            sender_id: r.sender,
            receiver_id: r.receiver,
            text: r.message,
            timestamp: r.timestamp,
            read: r.is_read,
        }
    }
}

#[async_trait]
pub trait MessageBackend: Send + Sync {
    /// Full snapshot of the conversation with one trainer
    async fn fetch_conversation(&self, trainer_id: i64) -> Result<Vec<RemoteMessage>>;

    /// Messages to or from the trainer, strictly newer than `since`
    /// (`None` fetches everything)
    async fn fetch_messages_since(
        &self,
        trainer_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteMessage>>;

    /// Send a message; returns the canonical record with the server id
    async fn send_message(
        &self,
        sender_id: i64,
        receiver_id: i64,
        text: &str,
    ) -> Result<RemoteMessage>;
}

/// reqwest-backed implementation of the REST contract
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    session: Session,
}

impl HttpBackend {
    pub fn new(config: &Config, session: Session) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            session,
        })
    }

    async fn fetch_json(&self, req: reqwest::RequestBuilder) -> Result<serde_json::Value> {
        let resp = req
            .header(reqwest::header::AUTHORIZATION, self.session.auth_header())
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ChatError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }
}

/// Decode a response body as a list of records.
///
/// Anything that is not a well-formed array is treated as an empty result;
/// a garbled response is never partially merged.
fn decode_records<T: DeserializeOwned>(value: serde_json::Value, endpoint: &str) -> Vec<T> {
    match serde_json::from_value::<Vec<T>>(value) {
        Ok(records) => records,
        Err(e) => {
            warn!("Malformed message list from {}: {}, treating as empty", endpoint, e);
            Vec::new()
        }
    }
}

#[async_trait]
impl MessageBackend for HttpBackend {
    async fn fetch_conversation(&self, trainer_id: i64) -> Result<Vec<RemoteMessage>> {
        let url = format!("{}/chat/trainer/{}/", self.base_url, trainer_id);
        let value = self.fetch_json(self.client.get(&url)).await?;
        let records: Vec<ConversationRecord> = decode_records(value, &url);

        // The snapshot endpoint omits the receiver; infer it from the session
        let me = self.session.user_id;
        Ok(records
            .into_iter()
            .map(|r| {
                let receiver = if r.sender == me { trainer_id } else { me };
                RemoteMessage {
                    id: r.id,
                    sender_id: r.sender,
                    receiver_id: receiver,
                    text: r.message,
                    timestamp: r.timestamp,
                    read: true,
                }
            })
            .collect())
    }

    async fn fetch_messages_since(
        &self,
        trainer_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteMessage>> {
        let url = format!("{}/trainer/{}/messages/", self.base_url, trainer_id);
        let mut req = self.client.get(&url);
        if let Some(since) = since {
            req = req.query(&[("since", since.to_rfc3339())]);
        }
        let value = self.fetch_json(req).await?;
        let records: Vec<InboxRecord> = decode_records(value, &url);
        Ok(records.into_iter().map(RemoteMessage::from).collect())
    }

    async fn send_message(
        &self,
        sender_id: i64,
        receiver_id: i64,
        text: &str,
    ) -> Result<RemoteMessage> {
        let url = format!("{}/messages/send/", self.base_url);
        let payload = SendPayload {
            sender_id,
            receiver_id,
            message: text,
        };
        let value = self.fetch_json(self.client.post(&url).json(&payload)).await?;
        let record: InboxRecord = serde_json::from_value(value)?;
        Ok(record.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inbox_record_decoding() {
        let value = json!([{
            "id": 5,
            "sender": 1,
            "receiver": 2,
            "message": "hi",
            "timestamp": "2024-01-01T00:00:00Z",
            "is_read": false
        }]);
        let records: Vec<InboxRecord> = decode_records(value, "test");
        assert_eq!(records.len(), 1);
        let msg = RemoteMessage::from(records.into_iter().next().unwrap());
        assert_eq!(msg.id, 5);
        assert_eq!(msg.sender_id, 1);
        assert_eq!(msg.receiver_id, 2);
        assert_eq!(msg.text, "hi");
        assert!(!msg.read);
    }

    #[test]
    fn test_conversation_record_decoding() {
        let value = json!([{
            "id": 9,
            "message": "see you at 6",
            "sender": 42,
            "timestamp": "2024-03-10T17:30:00Z"
        }]);
        let records: Vec<ConversationRecord> = decode_records(value, "test");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sender, 42);
    }

    #[test]
    fn test_malformed_payload_treated_as_empty() {
        let not_an_array = json!({"detail": "server had a bad day"});
        let records: Vec<InboxRecord> = decode_records(not_an_array, "test");
        assert!(records.is_empty());

        let garbled_entry = json!([{"id": "not-a-number"}]);
        let records: Vec<InboxRecord> = decode_records(garbled_entry, "test");
        assert!(records.is_empty());
    }

    #[test]
    fn test_send_payload_field_names() {
        let payload = SendPayload {
            sender_id: 1,
            receiver_id: 2,
            message: "hey",
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value, json!({"sender_id": 1, "receiver_id": 2, "message": "hey"}));
    }
}
