#![allow(dead_code)]

use chrono::{DateTime, Utc};
use eyre::Result;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::networks::Network;
use crate::types::EventStatus;

// Note: global_sequence is stored as NUMERIC(39,0) in the database to hold
// the chain's full unsigned counter range. We bind it as text and cast in
// the SQL query ($n::NUMERIC); when reading, the query casts it back to TEXT.

/// One ledger row for an inbound transfer action. Append-only.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TransferEvent {
    pub id: i64,
    pub network: String,
    pub block_number: i64,
    pub timestamp: DateTime<Utc>,
    pub transaction_id: String,
    pub global_sequence: String,
    pub event_version: Option<String>,
    pub event_type: Option<String>,
    pub event_payload: Option<serde_json::Value>,
    pub raw_action_data: serde_json::Value,
    pub console_output: String,
    pub created_at: DateTime<Utc>,
}

/// Application-level transfer payload emitted by the token contract.
/// User-controlled: every field may be missing or garbage.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransferPayload {
    pub transfer_id: Option<String>,
    pub from: Option<String>,
    pub target_blockchain: Option<String>,
    pub target_account: Option<String>,
    pub quantity: Option<String>,
}

impl TransferEvent {
    /// Network the event was observed on. The column is written only by our
    /// own watchers, so failure to parse is a data-corruption bug.
    pub fn network(&self) -> Result<Network> {
        self.network
            .parse()
            .map_err(|e: eyre::Report| e.wrap_err(format!("event {} has invalid network column", self.id)))
    }

    pub fn payload(&self) -> TransferPayload {
        self.event_payload
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    /// Destination network named inside the user-controlled payload.
    pub fn target_network(&self) -> Result<Network> {
        let payload = self.payload();
        let name = payload
            .target_blockchain
            .ok_or_else(|| eyre::eyre!("event {} payload has no target_blockchain", self.id))?;
        Network::from_payload_name(&name)
            .ok_or_else(|| eyre::eyre!("event {} targets unknown network \"{}\"", self.id, name))
    }

    /// A row ingested without a recognizable transfer payload. Still
    /// ledgered for audit, but it can only ever become `broken_event`.
    pub fn is_broken(&self) -> bool {
        let payload_empty = match &self.event_payload {
            Some(serde_json::Value::Object(map)) => map.is_empty(),
            Some(_) => false,
            None => true,
        };
        self.event_version.is_none() || self.event_type.is_none() || payload_empty
    }
}

/// For inserting new transfer events.
#[derive(Debug, Clone)]
pub struct NewTransferEvent {
    pub network: Network,
    pub block_number: i64,
    pub timestamp: DateTime<Utc>,
    pub transaction_id: String,
    pub global_sequence: String,
    pub event_version: Option<String>,
    pub event_type: Option<String>,
    pub event_payload: Option<serde_json::Value>,
    pub raw_action_data: serde_json::Value,
    pub console_output: String,
}

/// Mutable settlement state for one transfer event.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SettlementReport {
    pub event_id: i64,
    pub status: i32,
    pub retries: i32,
    pub last_error: String,
    pub updated_at: DateTime<Utc>,
}

impl SettlementReport {
    pub fn status(&self) -> Result<EventStatus> {
        EventStatus::from_i32(self.status).ok_or_else(|| {
            eyre::eyre!(
                "report {} has unknown status value {}",
                self.event_id,
                self.status
            )
        })
    }
}

/// Last fully committed block per watched network.
#[derive(Debug, Clone, FromRow)]
pub struct NetworkWatermark {
    pub network: String,
    pub last_committed_block: i64,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_with(
        version: Option<&str>,
        etype: Option<&str>,
        payload: Option<serde_json::Value>,
    ) -> TransferEvent {
        TransferEvent {
            id: 1,
            network: "mainnet".to_string(),
            block_number: 98_817_700,
            timestamp: Utc::now(),
            transaction_id: "ab".repeat(32),
            global_sequence: "8412351237".to_string(),
            event_version: version.map(|s| s.to_string()),
            event_type: etype.map(|s| s.to_string()),
            event_payload: payload,
            raw_action_data: json!({"to": "zoseosconvrt"}),
            console_output: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_broken_when_payload_missing() {
        assert!(event_with(Some("1.0"), Some("xtransfer"), None).is_broken());
    }

    #[test]
    fn test_broken_when_payload_empty_object() {
        assert!(event_with(Some("1.0"), Some("xtransfer"), Some(json!({}))).is_broken());
    }

    #[test]
    fn test_broken_when_version_missing() {
        let payload = json!({"transfer_id": "7"});
        assert!(event_with(None, Some("xtransfer"), Some(payload)).is_broken());
    }

    #[test]
    fn test_not_broken_with_full_event() {
        let payload = json!({"transfer_id": "7", "target_blockchain": "wax"});
        assert!(!event_with(Some("1.0"), Some("xtransfer"), Some(payload)).is_broken());
    }

    #[test]
    fn test_target_network_accepts_eos_alias() {
        let payload = json!({"target_blockchain": "eos"});
        let event = event_with(Some("1.0"), Some("xtransfer"), Some(payload));
        assert_eq!(event.target_network().unwrap(), Network::Mainnet);
    }

    #[test]
    fn test_target_network_rejects_unknown_name() {
        let payload = json!({"target_blockchain": "telos"});
        let event = event_with(Some("1.0"), Some("xtransfer"), Some(payload));
        assert!(event.target_network().is_err());
    }

    #[test]
    fn test_payload_tolerates_unexpected_shape() {
        let event = event_with(Some("1.0"), Some("xtransfer"), Some(json!("not an object")));
        let payload = event.payload();
        assert!(payload.transfer_id.is_none());
    }
}
