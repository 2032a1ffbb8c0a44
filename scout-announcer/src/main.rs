use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::net::UdpSocket;
use shared::net::bind_multicast;
use shared::protocol::{Message, ServerAnnounce, MAX_DATAGRAM, MULTICAST_GROUP, MULTICAST_PORT};
use shared::types::Metadata;

/// Unprompted announces go out this often
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(10);

const DEFAULT_PORT: u16 = 8080;

/// What this process claims to be
#[derive(Debug, Clone)]
struct Identity {
    server_id: String,
    name: String,
    ip: IpAddr,
    port: u16,
    metadata: Metadata,
}

impl Identity {
    fn announce(&self, now: DateTime<Utc>) -> Message {
        Message::ServerAnnounce(ServerAnnounce {
            server_id: Some(self.server_id.clone()),
            name: Some(self.name.clone()),
            ip: Some(self.ip.to_string()),
            port: Some(self.port),
            metadata: Some(self.metadata.clone()),
            timestamp: now.timestamp_millis(),
        })
    }
}

/// Whether a datagram asks us to announce
fn is_discovery_request(bytes: &[u8]) -> bool {
    matches!(Message::decode(bytes), Ok(Some(Message::DiscoveryRequest(_))))
}

fn default_name() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "Test Server".to_string())
}

/// First non-loopback IPv4 address, or loopback if there is none
fn local_ipv4() -> IpAddr {
    match local_ip_address::local_ip() {
        Ok(ip @ IpAddr::V4(v4)) if !v4.is_loopback() => ip,
        Ok(other) => {
            tracing::warn!("Ignoring local address {}, using loopback", other);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
        Err(e) => {
            tracing::warn!("Failed to find local address: {}", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

fn identity_from_args(args: &[String], now: DateTime<Utc>, ip: IpAddr) -> Result<Identity> {
    let name = args.first().cloned().unwrap_or_else(default_name);
    let port = match args.get(1) {
        Some(raw) => raw.parse::<u16>()
            .with_context(|| format!("Invalid port: {}", raw))?,
        None => DEFAULT_PORT,
    };

    let mut metadata = Metadata::new();
    metadata.insert("version".to_string(), json!(env!("CARGO_PKG_VERSION")));
    metadata.insert("location".to_string(), json!("Development"));
    metadata.insert("environment".to_string(), json!("test"));

    Ok(Identity {
        server_id: format!("server-{}", now.timestamp_millis()),
        name,
        ip,
        port,
        metadata,
    })
}

async fn send_announce(socket: &UdpSocket, target: SocketAddr, identity: &Identity) {
    let bytes = match identity.announce(Utc::now()).encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("Failed to encode announcement: {}", e);
            return;
        }
    };

    match socket.send_to(&bytes, target).await {
        Ok(_) => tracing::debug!("Sent server announcement"),
        Err(e) => tracing::warn!("Error sending announcement: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("scout_announcer=info"))
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let identity = identity_from_args(&args, Utc::now(), local_ipv4())?;

    let socket = bind_multicast(MULTICAST_GROUP, MULTICAST_PORT, Ipv4Addr::UNSPECIFIED)
        .context("Failed to bind multicast socket")?;
    let socket = UdpSocket::from_std(socket)
        .context("Failed to register socket with runtime")?;
    let target = SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, MULTICAST_PORT));

    tracing::info!(
        "Announcing {} ({}) at {}:{} on {}",
        identity.name,
        identity.server_id,
        identity.ip,
        identity.port,
        target
    );

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut ticker = tokio::time::interval(ANNOUNCE_INTERVAL);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, from)) if is_discovery_request(&buf[..len]) => {
                        tracing::info!("Received discovery request from {}", from);
                        send_announce(&socket, target, &identity).await;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!("Receive error: {}", e),
                }
            }
            _ = ticker.tick() => {
                send_announce(&socket, target, &identity).await;
            }
            _ = &mut shutdown => {
                tracing::info!("Shutting down announcer");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    #[test]
    fn test_identity_from_args() {
        let args = vec!["alpha".to_string(), "9000".to_string()];
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let identity = identity_from_args(&args, at(1_700_000_000_000), ip).unwrap();

        assert_eq!(identity.server_id, "server-1700000000000");
        assert_eq!(identity.name, "alpha");
        assert_eq!(identity.port, 9000);
        assert_eq!(identity.metadata["environment"], "test");
    }

    #[test]
    fn test_identity_rejects_bad_port() {
        let args = vec!["alpha".to_string(), "http".to_string()];
        assert!(identity_from_args(&args, at(0), IpAddr::V4(Ipv4Addr::LOCALHOST)).is_err());
    }

    #[test]
    fn test_announce_carries_identity() {
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        let identity = identity_from_args(&["beta".to_string()], at(0), ip).unwrap();
        let bytes = identity.announce(at(42)).encode().unwrap();

        match Message::decode(&bytes).unwrap() {
            Some(Message::ServerAnnounce(a)) => {
                assert_eq!(a.name.as_deref(), Some("beta"));
                assert_eq!(a.ip.as_deref(), Some("10.0.0.5"));
                assert_eq!(a.port, Some(DEFAULT_PORT));
                assert_eq!(a.timestamp, 42);
                assert_eq!(a.metadata_str("location"), Some("Development"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_answers_only_discovery_requests() {
        let request = Message::discovery_request(at(0)).encode().unwrap();
        assert!(is_discovery_request(&request));
        assert!(!is_discovery_request(br#"{"type":"server-announce"}"#));
        assert!(!is_discovery_request(b"garbage"));
    }
}
