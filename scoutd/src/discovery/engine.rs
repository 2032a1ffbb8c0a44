use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use shared::net::bind_multicast;
use shared::protocol::{Message, ServerAnnounce, MAX_DATAGRAM, META_LOCATION, META_TYPE, META_VERSION};
use shared::types::{ServerCandidate, ServerRecord};
use crate::config::DiscoveryConfig;
use crate::discovery::active_set::SharedActiveSet;
use crate::registry_manager::RegistryHandle;
use crate::view::ViewPublisher;

/// Name given to servers that announce without one
pub const UNKNOWN_SERVER_NAME: &str = "Unknown Server";

/// What the engine does with each datagram and timer tick.
///
/// Kept apart from the socket so the protocol handling can run without a
/// network.
#[derive(Clone)]
pub struct DiscoveryContext {
    registry: RegistryHandle,
    active: SharedActiveSet,
    publisher: ViewPublisher,
    ttl: Duration,
}

impl DiscoveryContext {
    pub fn new(
        registry: RegistryHandle,
        active: SharedActiveSet,
        publisher: ViewPublisher,
        ttl: Duration,
    ) -> Self {
        Self {
            registry,
            active,
            publisher,
            ttl,
        }
    }

    /// Handle one inbound datagram. Returns the server id an announce was
    /// recorded under; anything else yields None.
    pub async fn handle_datagram(&self, bytes: &[u8], from: SocketAddr, now: DateTime<Utc>) -> Option<String> {
        match Message::decode(bytes) {
            Ok(Some(Message::ServerAnnounce(announce))) => {
                match self.handle_announce(&announce, from, now).await {
                    Ok(record) => Some(record.id),
                    Err(e) => {
                        tracing::error!("Failed to record announce from {}: {}", from, e);
                        None
                    }
                }
            }
            Ok(Some(Message::DiscoveryRequest(_))) => {
                // Requests are for responders, including our own looped-back ones
                tracing::trace!("Ignoring discovery request from {}", from);
                None
            }
            Ok(None) => {
                tracing::debug!("Ignoring message of unknown type from {}", from);
                None
            }
            Err(e) => {
                tracing::warn!("Dropping malformed message from {}: {}", from, e);
                None
            }
        }
    }

    /// Record an announce durably, mark it live, then push the view.
    pub async fn handle_announce(
        &self,
        announce: &ServerAnnounce,
        from: SocketAddr,
        now: DateTime<Utc>,
    ) -> Result<ServerRecord> {
        let candidate = candidate_from_announce(announce, from, now);
        let record = self.registry.upsert(candidate).await?;
        tracing::debug!("Announce from {} ({}:{})", record.id, record.ip, record.port);

        let metadata = announce.metadata.clone().unwrap_or_default();
        self.active.lock().touch(&record.id, now, metadata);

        if let Err(e) = self.publisher.publish().await {
            tracing::error!("Failed to publish view: {}", e);
        }

        Ok(record)
    }

    /// Evict servers silent past the TTL and push the view regardless.
    /// Returns the evicted ids.
    pub async fn handle_tick(&self, now: DateTime<Utc>) -> Vec<String> {
        let (expired, online) = {
            let mut active = self.active.lock();
            let expired = active.sweep(now, self.ttl);
            (expired, active.len())
        };
        for id in &expired {
            tracing::info!("Server {} went offline", id);
        }
        tracing::debug!("{} servers online", online);

        if let Err(e) = self.publisher.publish().await {
            tracing::error!("Failed to publish view: {}", e);
        }

        expired
    }
}

/// Build a registry candidate, filling gaps from the transport address.
/// Empty strings and a zero port count as missing.
pub fn candidate_from_announce(
    announce: &ServerAnnounce,
    from: SocketAddr,
    now: DateTime<Utc>,
) -> ServerCandidate {
    let sender_ip = from.ip().to_string();
    let present = |value: &Option<String>| value.as_deref().filter(|s| !s.is_empty()).map(str::to_string);
    let meta = |key: &str| announce.metadata_str(key).filter(|s| !s.is_empty()).map(str::to_string);

    ServerCandidate {
        id: present(&announce.server_id).unwrap_or_else(|| sender_ip.clone()),
        name: present(&announce.name).unwrap_or_else(|| UNKNOWN_SERVER_NAME.to_string()),
        ip: present(&announce.ip).unwrap_or(sender_ip),
        port: announce.port.filter(|&p| p != 0).unwrap_or_else(|| from.port()),
        version: meta(META_VERSION),
        location: meta(META_LOCATION),
        server_type: meta(META_TYPE),
        last_seen: now,
        is_favorite: false,
        notes: None,
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Multicast discovery: listens for announces, periodically asks for them,
/// and keeps this engine's active set current.
pub struct DiscoveryEngine {
    config: DiscoveryConfig,
    active: SharedActiveSet,
    publisher: ViewPublisher,
    context: DiscoveryContext,
    running: Option<Running>,
}

impl DiscoveryEngine {
    pub fn new(config: DiscoveryConfig, registry: RegistryHandle) -> Self {
        let active = SharedActiveSet::new();
        let publisher = ViewPublisher::new(registry.clone(), active.clone());
        let context = DiscoveryContext::new(registry, active.clone(), publisher.clone(), config.ttl());

        Self {
            config,
            active,
            publisher,
            context,
            running: None,
        }
    }

    /// Publisher for this engine's merged view
    pub fn publisher(&self) -> ViewPublisher {
        self.publisher.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bind and join the group, then start the receive/request loop.
    /// Does nothing if already running. Bind failures are returned.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            tracing::debug!("Discovery already running");
            return Ok(());
        }

        let group = self.config.group;
        let port = self.config.port;
        let std_socket = bind_multicast(group, port, self.config.interface)
            .with_context(|| format!("Failed to bind discovery socket on {}:{}", group, port))?;
        let socket = UdpSocket::from_std(std_socket)
            .context("Failed to register discovery socket with runtime")?;

        let cancel = CancellationToken::new();
        let target = SocketAddr::V4(SocketAddrV4::new(group, port));
        let task = tokio::spawn(run_engine(
            socket,
            target,
            self.context.clone(),
            self.config.request_interval(),
            cancel.clone(),
        ));

        self.running = Some(Running { cancel, task });
        tracing::info!("Listening for server announcements on {}:{}", group, port);
        Ok(())
    }

    /// Stop the loop, close the socket and forget every live server.
    /// Safe to call repeatedly.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        running.cancel.cancel();
        if let Err(e) = running.task.await {
            tracing::error!("Discovery task ended abnormally: {}", e);
        }

        self.active.lock().clear();
        if let Err(e) = self.publisher.publish().await {
            tracing::error!("Failed to publish view: {}", e);
        }

        tracing::info!("Discovery stopped");
    }

    /// Drop a server from the active set, e.g. after it was deleted
    pub fn forget(&self, id: &str) -> bool {
        self.active.lock().remove(id)
    }
}

/// Single reactor: datagrams, timer ticks and cancellation are handled one
/// at a time, so registry and active set updates never interleave.
async fn run_engine(
    socket: UdpSocket,
    target: SocketAddr,
    context: DiscoveryContext,
    request_interval: Duration,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut ticker = tokio::time::interval(request_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Discovery loop shutting down");
                break;
            }

            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, from)) => {
                        context.handle_datagram(&buf[..len], from, Utc::now()).await;
                    }
                    Err(e) => {
                        tracing::warn!("Discovery receive error: {}", e);
                    }
                }
            }

            _ = ticker.tick() => {
                send_discovery_request(&socket, target).await;
                context.handle_tick(Utc::now()).await;
            }
        }
    }
}

/// Best effort: a failed send waits for the next tick
async fn send_discovery_request(socket: &UdpSocket, target: SocketAddr) {
    let bytes = match Message::discovery_request(Utc::now()).encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("Failed to encode discovery request: {}", e);
            return;
        }
    };

    if let Err(e) = socket.send_to(&bytes, target).await {
        tracing::warn!("Failed to send discovery request to {}: {}", target, e);
    }
}
