use std::net::Ipv4Addr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use serde_json::Value;
use crate::types::Metadata;

/// Multicast group the discovery protocol runs on
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const MULTICAST_PORT: u16 = 9876;

/// Largest payload a single UDP datagram can carry
pub const MAX_DATAGRAM: usize = 65_507;

/// Message type tags as they appear on the wire
pub const TYPE_DISCOVERY_REQUEST: &str = "discovery-request";
pub const TYPE_SERVER_ANNOUNCE: &str = "server-announce";

/// Metadata keys lifted into the durable record
pub const META_VERSION: &str = "version";
pub const META_LOCATION: &str = "location";
pub const META_TYPE: &str = "type";

/// API path prefix
pub const API_PREFIX: &str = "/v1";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no type tag")]
    MissingType,
}

/// Every message the discovery protocol knows about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    DiscoveryRequest(DiscoveryRequest),
    ServerAnnounce(ServerAnnounce),
}

/// Broadcast to prompt announces from listening servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    /// Sender clock, epoch milliseconds
    #[serde(default)]
    pub timestamp: i64,
}

/// A server asserting its identity and address. Every field is optional;
/// receivers fill gaps from the transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerAnnounce {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub timestamp: i64,
}

impl ServerAnnounce {
    /// String value of a metadata key, if present and a string
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(key))
            .and_then(Value::as_str)
    }
}

impl Message {
    pub fn discovery_request(now: DateTime<Utc>) -> Self {
        Message::DiscoveryRequest(DiscoveryRequest {
            timestamp: now.timestamp_millis(),
        })
    }

    /// Parse a datagram. Returns `Ok(None)` for well-formed messages whose
    /// type tag this version does not know, so newer peers are tolerated.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;

        match kind {
            TYPE_DISCOVERY_REQUEST | TYPE_SERVER_ANNOUNCE => {
                Ok(Some(serde_json::from_value(value)?))
            }
            _ => Ok(None),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }
}
