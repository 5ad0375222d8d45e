//! Common types for MailSift

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for work items (UUIDv7, time-sortable)
pub type WorkItemId = Uuid;

/// Unique identifier for a worker process
pub type WorkerId = Uuid;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Where a message entered the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// Remote host name or address
    pub host: String,

    /// Remote port (0 when not applicable)
    pub port: u16,

    /// Ingestion protocol, e.g. "smtp", "imap", "milter", "file"
    pub protocol: String,
}

impl Origin {
    /// Create a new origin
    pub fn new(host: impl Into<String>, port: u16, protocol: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: protocol.into(),
        }
    }
}

/// One unit of ingested mail awaiting parsing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,

    /// Envelope sender (MAIL FROM)
    pub sender: String,

    /// Envelope recipients (RCPT TO)
    pub recipients: Vec<String>,

    pub origin: Origin,

    pub received_at: Timestamp,

    /// Raw RFC 5322 message bytes
    pub raw: Vec<u8>,
}

impl WorkItem {
    /// Create a work item with a fresh time-sortable id
    pub fn new(
        sender: impl Into<String>,
        recipients: Vec<String>,
        origin: Origin,
        raw: Vec<u8>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            sender: sender.into(),
            recipients,
            origin,
            received_at: Utc::now(),
            raw,
        }
    }

    /// Serialize into the queue's stored record format (named MessagePack)
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize from the queue's stored record format
    pub fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Creation time embedded in the id, if the id is a UUIDv7
    pub fn created_at(&self) -> Option<Timestamp> {
        id_timestamp(&self.id)
    }
}

/// Extract the creation timestamp embedded in a UUIDv7
pub fn id_timestamp(id: &Uuid) -> Option<Timestamp> {
    let (secs, nanos) = id.get_timestamp()?.to_unix();
    Utc.timestamp_opt(secs as i64, nanos).single()
}

/// Parsed features for one work item, as consumed by result sinks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// String form of the originating work item id
    pub uid: String,

    pub sender: String,

    #[serde(default)]
    pub recipients: Vec<String>,

    pub received_at: Timestamp,

    pub parsed_at: Timestamp,

    /// Worker that produced this record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerId>,

    /// Parser output; opaque to the queue and protocol layers
    #[serde(default)]
    pub features: serde_json::Value,
}

impl ResultRecord {
    /// Start a result record for the given work item
    pub fn for_item(item: &WorkItem, features: serde_json::Value) -> Self {
        Self {
            uid: item.id.to_string(),
            sender: item.sender.clone(),
            recipients: item.recipients.clone(),
            received_at: item.received_at,
            parsed_at: Utc::now(),
            worker: None,
            features,
        }
    }

    /// Parse the uid back into a work item id
    pub fn item_id(&self) -> crate::Result<WorkItemId> {
        Uuid::parse_str(&self.uid)
            .map_err(|e| crate::Error::Validation(format!("Invalid result uid: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> WorkItem {
        WorkItem::new(
            "alice@example.com",
            vec!["bob@example.org".to_string()],
            Origin::new("192.0.2.10", 25, "smtp"),
            b"Subject: hi\r\n\r\nhello".to_vec(),
        )
    }

    #[test]
    fn test_work_item_encoding() {
        let item = sample();
        let bytes = item.encode().unwrap();
        assert_eq!(WorkItem::decode(&bytes).unwrap(), item);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(WorkItem::decode(b"\x01\x02not msgpack").is_err());
    }

    #[test]
    fn test_ids_are_time_sortable() {
        let first = sample();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = sample();
        assert!(first.id < second.id);
    }

    #[test]
    fn test_created_at_close_to_received_at() {
        let item = sample();
        let created = item.created_at().unwrap();
        let drift = (item.received_at - created).num_milliseconds().abs();
        assert!(drift < 1000, "drift was {}ms", drift);
    }

    #[test]
    fn test_created_at_absent_for_v4() {
        let mut item = sample();
        item.id = Uuid::new_v4();
        assert!(item.created_at().is_none());
    }

    #[test]
    fn test_result_record_uid() {
        let item = sample();
        let record = ResultRecord::for_item(&item, serde_json::json!({"subject": "hi"}));
        assert_eq!(record.item_id().unwrap(), item.id);

        let json = serde_json::to_string(&record).unwrap();
        let back: ResultRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
