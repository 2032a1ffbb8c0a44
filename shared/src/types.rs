use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use chrono::serde::ts_milliseconds;
use serde::{Serialize, Deserialize};
use serde_json::{Map, Value};

/// Metadata attached to an announce, kept verbatim (unknown keys included).
pub type Metadata = Map<String, Value>;

/// A server known to the registry.
/// This is the durable record shared by the daemon, its API and any client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    /// Stable identity, the announced `serverId` or the sender address
    pub id: String,

    pub name: String,

    /// Address as announced (or as observed on the wire)
    pub ip: String,

    pub port: u16,

    pub version: Option<String>,

    pub location: Option<String>,

    #[serde(rename = "type")]
    pub server_type: Option<String>,

    /// Last time an announce refreshed this record
    #[serde(with = "ts_milliseconds")]
    pub last_seen: DateTime<Utc>,

    /// Set on first insert, never changed afterwards
    #[serde(with = "ts_milliseconds")]
    pub first_discovered: DateTime<Utc>,

    pub is_favorite: bool,

    pub notes: Option<String>,

    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

/// Input to a registry upsert: everything an announce can tell us.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerCandidate {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub version: Option<String>,
    pub location: Option<String>,
    pub server_type: Option<String>,
    pub last_seen: DateTime<Utc>,
    /// Only honoured when the record is first inserted
    pub is_favorite: bool,
    /// Replaces stored notes only when non-empty
    pub notes: Option<String>,
}

/// Kind of state change recorded in the history table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Discovered,
    ModifiedIp,
    Updated,
    Connected,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Discovered => "discovered",
            HistoryAction::ModifiedIp => "modified_ip",
            HistoryAction::Updated => "updated",
            HistoryAction::Connected => "connected",
        }
    }
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown history action: {0}")]
pub struct UnknownAction(pub String);

impl FromStr for HistoryAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovered" => Ok(HistoryAction::Discovered),
            "modified_ip" => Ok(HistoryAction::ModifiedIp),
            "updated" => Ok(HistoryAction::Updated),
            "connected" => Ok(HistoryAction::Connected),
            other => Err(UnknownAction(other.to_string())),
        }
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: i64,
    pub server_id: String,
    pub action: HistoryAction,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    #[serde(with = "ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Online,
    Offline,
}

/// A registry record joined with live reachability, as shown to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerView {
    #[serde(flatten)]
    pub record: ServerRecord,

    pub status: ServerStatus,

    /// Last announced metadata while online, empty otherwise
    pub metadata: Metadata,
}

/// Counters describing the registry contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_servers: u64,
    pub active_servers: u64,
    pub favorite_servers: u64,
    pub total_history: u64,
    pub db_path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_action_names() {
        for action in [
            HistoryAction::Discovered,
            HistoryAction::ModifiedIp,
            HistoryAction::Updated,
            HistoryAction::Connected,
        ] {
            assert_eq!(action.as_str().parse::<HistoryAction>().unwrap(), action);
            let json = serde_json::to_string(&action).unwrap();
            assert_eq!(json, format!("\"{}\"", action.as_str()));
        }
        assert!("renamed".parse::<HistoryAction>().is_err());
    }

    #[test]
    fn test_view_flattens_record() {
        let now = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000).unwrap();
        let view = ServerView {
            record: ServerRecord {
                id: "A".to_string(),
                name: "alpha".to_string(),
                ip: "10.0.0.1".to_string(),
                port: 8080,
                version: None,
                location: None,
                server_type: Some("game".to_string()),
                last_seen: now,
                first_discovered: now,
                is_favorite: true,
                notes: None,
                created_at: now,
                updated_at: now,
            },
            status: ServerStatus::Online,
            metadata: Metadata::new(),
        };

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["id"], "A");
        assert_eq!(json["type"], "game");
        assert_eq!(json["isFavorite"], true);
        assert_eq!(json["lastSeen"], 1_700_000_000_000i64);
        assert_eq!(json["status"], "online");
    }
}
