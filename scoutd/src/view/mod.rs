pub mod hash;

use std::sync::Arc;
use anyhow::Result;
use tokio::sync::watch;
use shared::types::{Metadata, ServerRecord, ServerStatus, ServerView};
use crate::discovery::active_set::{ActiveSet, SharedActiveSet};
use crate::registry_manager::RegistryHandle;

/// Join registry records with live reachability.
///
/// A record is online exactly when its id is in the active set; online
/// records carry the last announced metadata, offline ones an empty map.
/// Record order is preserved.
pub fn merge(records: Vec<ServerRecord>, active: &ActiveSet) -> Vec<ServerView> {
    records
        .into_iter()
        .map(|record| {
            let (status, metadata) = match active.get(&record.id) {
                Some(entry) => (ServerStatus::Online, entry.metadata.clone()),
                None => (ServerStatus::Offline, Metadata::new()),
            };
            ServerView {
                record,
                status,
                metadata,
            }
        })
        .collect()
}

/// Recomputes the merged view and pushes it to subscribers
#[derive(Clone)]
pub struct ViewPublisher {
    registry: RegistryHandle,
    active: SharedActiveSet,
    tx: Arc<watch::Sender<Vec<ServerView>>>,
}

impl ViewPublisher {
    pub fn new(registry: RegistryHandle, active: SharedActiveSet) -> Self {
        let (tx, _rx) = watch::channel(Vec::new());
        Self {
            registry,
            active,
            tx: Arc::new(tx),
        }
    }

    /// Merge an arbitrary registry snapshot with the current active set
    pub fn merge(&self, records: Vec<ServerRecord>) -> Vec<ServerView> {
        merge(records, &self.active.lock())
    }

    /// Fresh view of every known server
    pub async fn current(&self) -> Result<Vec<ServerView>> {
        let records = self.registry.get_all().await?;
        Ok(self.merge(records))
    }

    /// Recompute and push, whether or not anything changed
    pub async fn publish(&self) -> Result<()> {
        let view = self.current().await?;
        tracing::trace!("Publishing view of {} servers", view.len());
        self.tx.send_replace(view);
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<ServerView>> {
        self.tx.subscribe()
    }
}
