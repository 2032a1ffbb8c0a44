use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use chrono::{DateTime, Utc};
use shared::types::Metadata;

/// A server currently considered reachable
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveEntry {
    pub last_seen: DateTime<Utc>,
    pub metadata: Metadata,
}

/// Servers heard from recently, keyed by server id.
///
/// Derived purely from announces and never read back as a source of truth
/// for durable fields. Losing it only costs the online/offline signal.
#[derive(Debug, Default)]
pub struct ActiveSet {
    entries: HashMap<String, ActiveEntry>,
}

impl ActiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh an entry
    pub fn touch(&mut self, id: &str, now: DateTime<Utc>, metadata: Metadata) {
        self.entries.insert(
            id.to_string(),
            ActiveEntry {
                last_seen: now,
                metadata,
            },
        );
    }

    /// Evict entries silent for longer than `ttl`, returning their ids
    pub fn sweep(&mut self, now: DateTime<Utc>, ttl: Duration) -> Vec<String> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let mut expired = Vec::new();

        self.entries.retain(|id, entry| {
            let silent_for = now
                .timestamp_millis()
                .saturating_sub(entry.last_seen.timestamp_millis());
            if silent_for > ttl_ms {
                expired.push(id.clone());
                false
            } else {
                true
            }
        });

        expired
    }

    pub fn get(&self, id: &str) -> Option<&ActiveEntry> {
        self.entries.get(id)
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// ActiveSet shared between one engine's task and its view publisher
#[derive(Debug, Clone, Default)]
pub struct SharedActiveSet(Arc<Mutex<ActiveSet>>);

impl SharedActiveSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the set, ignoring poisoning (entries are independent)
    pub fn lock(&self) -> MutexGuard<'_, ActiveSet> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
