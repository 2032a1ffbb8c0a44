use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use shared::types::{HistoryEntry, RegistryStats, ServerCandidate, ServerRecord};
use crate::config::RegistryConfig;
use crate::registry::db::RegistryDb;

/// Commands executed, one at a time, on the registry thread
pub enum RegistryCommand {
    Upsert(ServerCandidate, oneshot::Sender<Result<ServerRecord>>),
    GetOne(String, oneshot::Sender<Result<Option<ServerRecord>>>),
    GetAll(oneshot::Sender<Result<Vec<ServerRecord>>>),
    GetActive(Duration, oneshot::Sender<Result<Vec<ServerRecord>>>),
    GetFavorites(oneshot::Sender<Result<Vec<ServerRecord>>>),
    UpdateIp {
        id: String,
        ip: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    ToggleFavorite(String, oneshot::Sender<Result<Option<bool>>>),
    UpdateNotes {
        id: String,
        notes: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Delete(String, oneshot::Sender<Result<bool>>),
    HistoryFor {
        id: String,
        limit: u32,
        reply: oneshot::Sender<Result<Vec<HistoryEntry>>>,
    },
    AllHistory(u32, oneshot::Sender<Result<Vec<HistoryEntry>>>),
    PurgeHistory {
        days: u32,
        reply: oneshot::Sender<Result<u64>>,
    },
    Stats(Duration, oneshot::Sender<Result<RegistryStats>>),
    Shutdown,
}

/// Handle to the registry thread.
///
/// Every caller, the discovery engine and API commands alike, goes through
/// this queue, so store access is serialized without a lock.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    /// Spawn the registry thread that owns `db`
    pub fn spawn(db: RegistryDb) -> Self {
        let (tx, mut rx) = mpsc::channel::<RegistryCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    RegistryCommand::Upsert(candidate, reply) => {
                        let _ = reply.send(db.upsert_server(&candidate));
                    }
                    RegistryCommand::GetOne(id, reply) => {
                        let _ = reply.send(db.get_server(&id));
                    }
                    RegistryCommand::GetAll(reply) => {
                        let _ = reply.send(db.get_all_servers());
                    }
                    RegistryCommand::GetActive(timeout, reply) => {
                        let _ = reply.send(db.get_active_servers(timeout));
                    }
                    RegistryCommand::GetFavorites(reply) => {
                        let _ = reply.send(db.get_favorite_servers());
                    }
                    RegistryCommand::UpdateIp { id, ip, reply } => {
                        let _ = reply.send(db.update_ip(&id, &ip));
                    }
                    RegistryCommand::ToggleFavorite(id, reply) => {
                        let _ = reply.send(db.toggle_favorite(&id));
                    }
                    RegistryCommand::UpdateNotes { id, notes, reply } => {
                        let _ = reply.send(db.update_notes(&id, &notes));
                    }
                    RegistryCommand::Delete(id, reply) => {
                        let _ = reply.send(db.delete_server(&id));
                    }
                    RegistryCommand::HistoryFor { id, limit, reply } => {
                        let _ = reply.send(db.history_for(&id, limit));
                    }
                    RegistryCommand::AllHistory(limit, reply) => {
                        let _ = reply.send(db.all_history(limit));
                    }
                    RegistryCommand::PurgeHistory { days, reply } => {
                        let _ = reply.send(db.purge_history_older_than_days(days));
                    }
                    RegistryCommand::Stats(window, reply) => {
                        let _ = reply.send(db.stats(window));
                    }
                    RegistryCommand::Shutdown => {
                        tracing::info!("Registry thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> RegistryCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await?;
        rx.await?
    }

    /// Insert or refresh a server, returning the stored record
    pub async fn upsert(&self, candidate: ServerCandidate) -> Result<ServerRecord> {
        self.request(|reply| RegistryCommand::Upsert(candidate, reply)).await
    }

    pub async fn get_one(&self, id: String) -> Result<Option<ServerRecord>> {
        self.request(|reply| RegistryCommand::GetOne(id, reply)).await
    }

    pub async fn get_all(&self) -> Result<Vec<ServerRecord>> {
        self.request(RegistryCommand::GetAll).await
    }

    /// Servers seen within `timeout`
    pub async fn get_active(&self, timeout: Duration) -> Result<Vec<ServerRecord>> {
        self.request(|reply| RegistryCommand::GetActive(timeout, reply)).await
    }

    pub async fn get_favorites(&self) -> Result<Vec<ServerRecord>> {
        self.request(RegistryCommand::GetFavorites).await
    }

    /// Returns false if the id is unknown
    pub async fn update_ip(&self, id: String, ip: String) -> Result<bool> {
        self.request(|reply| RegistryCommand::UpdateIp { id, ip, reply }).await
    }

    /// Returns the new flag, or None if the id is unknown
    pub async fn toggle_favorite(&self, id: String) -> Result<Option<bool>> {
        self.request(|reply| RegistryCommand::ToggleFavorite(id, reply)).await
    }

    /// Returns false if the id is unknown
    pub async fn update_notes(&self, id: String, notes: String) -> Result<bool> {
        self.request(|reply| RegistryCommand::UpdateNotes { id, notes, reply }).await
    }

    /// Returns whether a server was removed
    pub async fn delete(&self, id: String) -> Result<bool> {
        self.request(|reply| RegistryCommand::Delete(id, reply)).await
    }

    pub async fn history_for(&self, id: String, limit: u32) -> Result<Vec<HistoryEntry>> {
        self.request(|reply| RegistryCommand::HistoryFor { id, limit, reply }).await
    }

    pub async fn all_history(&self, limit: u32) -> Result<Vec<HistoryEntry>> {
        self.request(|reply| RegistryCommand::AllHistory(limit, reply)).await
    }

    /// Drop history older than `days`, returning the number of entries removed
    pub async fn purge_history(&self, days: u32) -> Result<u64> {
        self.request(|reply| RegistryCommand::PurgeHistory { days, reply }).await
    }

    pub async fn stats(&self, active_window: Duration) -> Result<RegistryStats> {
        self.request(|reply| RegistryCommand::Stats(active_window, reply)).await
    }

    /// Shutdown the registry thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(RegistryCommand::Shutdown).await?;
        Ok(())
    }
}

/// Registry maintenance loop - periodic history retention sweep
pub async fn run(
    registry: RegistryHandle,
    config: RegistryConfig,
    cancel: CancellationToken,
) -> Result<()> {
    anyhow::ensure!(
        config.maintenance_interval_secs > 0,
        "maintenance interval must be positive"
    );
    let mut maintenance_interval = tokio::time::interval(
        Duration::from_secs(config.maintenance_interval_secs)
    );

    loop {
        tokio::select! {
            _ = maintenance_interval.tick() => {
                match registry.purge_history(config.history_retention_days).await {
                    Ok(0) => {}
                    Ok(removed) => {
                        tracing::info!("Purged {} history entries", removed);
                    }
                    Err(e) => {
                        tracing::error!("Failed to purge history: {}", e);
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Registry maintenance shutting down");
                break;
            }
        }
    }

    Ok(())
}
