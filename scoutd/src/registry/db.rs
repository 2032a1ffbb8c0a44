use std::path::Path;
use std::time::Duration;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use shared::types::{HistoryAction, HistoryEntry, RegistryStats, ServerCandidate, ServerRecord};

const SERVER_COLUMNS: &str = "id, name, ip, port, version, location, type, last_seen,
    first_discovered, is_favorite, notes, created_at, updated_at";

const HISTORY_COLUMNS: &str = "id, server_id, action, old_value, new_value, timestamp";

/// Durable store of every server ever seen plus its audit trail.
///
/// A `RegistryDb` only exists once the schema is in place, so no operation
/// can run against an uninitialised store.
pub struct RegistryDb {
    conn: Connection,
    path: String,
}

impl RegistryDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        Self::init(conn, path.display().to_string())
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to create in-memory database")?;
        Self::init(conn, ":memory:".to_string())
    }

    fn init(conn: Connection, path: String) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        // History rows cascade with their server only when enforcement is on
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .context("Failed to enable foreign keys")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                id               TEXT PRIMARY KEY,
                name             TEXT NOT NULL,
                ip               TEXT NOT NULL,
                port             INTEGER NOT NULL,
                version          TEXT,
                location         TEXT,
                type             TEXT,
                last_seen        INTEGER NOT NULL,
                first_discovered INTEGER NOT NULL,
                is_favorite      INTEGER NOT NULL DEFAULT 0,
                notes            TEXT,
                created_at       INTEGER NOT NULL,
                updated_at       INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS server_history (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id TEXT NOT NULL,
                action    TEXT NOT NULL,
                old_value TEXT,
                new_value TEXT,
                timestamp INTEGER NOT NULL,
                FOREIGN KEY (server_id) REFERENCES servers(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_servers_last_seen ON servers(last_seen);
            CREATE INDEX IF NOT EXISTS idx_servers_is_favorite ON servers(is_favorite);
            CREATE INDEX IF NOT EXISTS idx_history_server_id ON server_history(server_id);
            CREATE INDEX IF NOT EXISTS idx_history_timestamp ON server_history(timestamp);
            "#,
        )
        .context("Failed to create database schema")?;

        tracing::debug!("Registry schema ready at {}", path);
        Ok(Self { conn, path })
    }

    /// Insert a newly seen server or refresh a known one.
    ///
    /// Favorite flag, first-discovery time and notes survive a refresh; notes
    /// are replaced only by a non-empty candidate value. The record write and
    /// its history entry commit together.
    pub fn upsert_server(&self, candidate: &ServerCandidate) -> Result<ServerRecord> {
        let now = Utc::now().timestamp_millis();
        let tx = self.conn.unchecked_transaction()
            .context("Failed to begin upsert transaction")?;

        match query_server(&tx, &candidate.id)? {
            Some(existing) => {
                tx.execute(
                    r#"
                    UPDATE servers
                    SET name = ?1, ip = ?2, port = ?3, version = ?4, location = ?5,
                        type = ?6, last_seen = ?7, notes = COALESCE(?8, notes),
                        updated_at = ?9
                    WHERE id = ?10
                    "#,
                    params![
                        &candidate.name,
                        &candidate.ip,
                        candidate.port,
                        non_empty(&candidate.version),
                        non_empty(&candidate.location),
                        non_empty(&candidate.server_type),
                        candidate.last_seen.timestamp_millis(),
                        non_empty(&candidate.notes),
                        now,
                        &candidate.id,
                    ],
                )
                .context("Failed to update server")?;

                if existing.ip != candidate.ip {
                    tracing::info!(
                        "Server {} moved from {} to {}",
                        candidate.id,
                        existing.ip,
                        candidate.ip
                    );
                    append_history(
                        &tx,
                        &candidate.id,
                        HistoryAction::ModifiedIp,
                        Some(&existing.ip),
                        Some(&candidate.ip),
                        now,
                    )?;
                }
            }
            None => {
                tx.execute(
                    r#"
                    INSERT INTO servers (
                        id, name, ip, port, version, location, type, last_seen,
                        first_discovered, is_favorite, notes, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?9, ?9)
                    "#,
                    params![
                        &candidate.id,
                        &candidate.name,
                        &candidate.ip,
                        candidate.port,
                        non_empty(&candidate.version),
                        non_empty(&candidate.location),
                        non_empty(&candidate.server_type),
                        candidate.last_seen.timestamp_millis(),
                        now,
                        candidate.is_favorite,
                        non_empty(&candidate.notes),
                    ],
                )
                .context("Failed to insert server")?;

                tracing::info!("Discovered server {} at {}", candidate.id, candidate.ip);
                append_history(
                    &tx,
                    &candidate.id,
                    HistoryAction::Discovered,
                    None,
                    Some(&candidate.ip),
                    now,
                )?;
            }
        }

        let stored = query_server(&tx, &candidate.id)?
            .with_context(|| format!("Server {} missing after upsert", candidate.id))?;
        tx.commit().context("Failed to commit upsert")?;

        Ok(stored)
    }

    /// Get a single server by id
    pub fn get_server(&self, id: &str) -> Result<Option<ServerRecord>> {
        query_server(&self.conn, id)
    }

    /// All servers, most recently seen first
    pub fn get_all_servers(&self) -> Result<Vec<ServerRecord>> {
        self.query_servers("1 = 1", [])
    }

    /// Servers seen within `timeout` of now
    pub fn get_active_servers(&self, timeout: Duration) -> Result<Vec<ServerRecord>> {
        self.get_active_servers_at(timeout, Utc::now())
    }

    /// Servers with `last_seen` strictly after `now - timeout`
    pub fn get_active_servers_at(&self, timeout: Duration, now: DateTime<Utc>) -> Result<Vec<ServerRecord>> {
        let cutoff = active_cutoff(now, timeout);
        self.query_servers("last_seen > ?1", [cutoff])
    }

    pub fn get_favorite_servers(&self) -> Result<Vec<ServerRecord>> {
        self.query_servers("is_favorite = 1", [])
    }

    /// Change a server's address by hand. Returns false for unknown ids.
    pub fn update_ip(&self, id: &str, new_ip: &str) -> Result<bool> {
        let tx = self.conn.unchecked_transaction()
            .context("Failed to begin ip update")?;

        let Some(existing) = query_server(&tx, id)? else {
            return Ok(false);
        };

        let now = Utc::now().timestamp_millis();
        tx.execute(
            "UPDATE servers SET ip = ?1, updated_at = ?2 WHERE id = ?3",
            params![new_ip, now, id],
        )
        .context("Failed to update server ip")?;

        append_history(&tx, id, HistoryAction::ModifiedIp, Some(&existing.ip), Some(new_ip), now)?;
        tx.commit().context("Failed to commit ip update")?;

        Ok(true)
    }

    /// Flip the favorite flag. Returns the new value, or None for unknown ids.
    pub fn toggle_favorite(&self, id: &str) -> Result<Option<bool>> {
        let state = self
            .conn
            .query_row(
                "UPDATE servers SET is_favorite = NOT is_favorite, updated_at = ?1
                 WHERE id = ?2 RETURNING is_favorite",
                params![Utc::now().timestamp_millis(), id],
                |row| row.get::<_, bool>(0),
            )
            .optional()
            .context("Failed to toggle favorite")?;

        Ok(state)
    }

    /// Overwrite notes. Returns false for unknown ids.
    pub fn update_notes(&self, id: &str, notes: &str) -> Result<bool> {
        let count = self.conn.execute(
            "UPDATE servers SET notes = ?1, updated_at = ?2 WHERE id = ?3",
            params![notes, Utc::now().timestamp_millis(), id],
        )
        .context("Failed to update notes")?;

        Ok(count > 0)
    }

    /// Remove a server and, by cascade, its history
    pub fn delete_server(&self, id: &str) -> Result<bool> {
        let count = self.conn.execute("DELETE FROM servers WHERE id = ?1", params![id])
            .context("Failed to delete server")?;

        Ok(count > 0)
    }

    /// History of one server, newest first
    pub fn history_for(&self, id: &str, limit: u32) -> Result<Vec<HistoryEntry>> {
        let sql = format!(
            "SELECT {} FROM server_history WHERE server_id = ?1
             ORDER BY timestamp DESC, id DESC LIMIT ?2",
            HISTORY_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare query")?;

        let entries = stmt
            .query_map(params![id, limit], row_to_history)
            .context("Failed to query history")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect history")?;

        Ok(entries)
    }

    /// History across all servers, newest first
    pub fn all_history(&self, limit: u32) -> Result<Vec<HistoryEntry>> {
        let sql = format!(
            "SELECT {} FROM server_history ORDER BY timestamp DESC, id DESC LIMIT ?1",
            HISTORY_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare query")?;

        let entries = stmt
            .query_map(params![limit], row_to_history)
            .context("Failed to query history")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect history")?;

        Ok(entries)
    }

    /// Delete history entries stamped before `cutoff`
    pub fn purge_history_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let count = self.conn.execute(
            "DELETE FROM server_history WHERE timestamp < ?1",
            params![cutoff.timestamp_millis()],
        )
        .context("Failed to purge history")?;

        Ok(count as u64)
    }

    /// Retention sweep: keep only the last `days` days of history
    pub fn purge_history_older_than_days(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now()
            .checked_sub_signed(chrono::Duration::days(i64::from(days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.purge_history_older_than(cutoff)
    }

    pub fn stats(&self, active_window: Duration) -> Result<RegistryStats> {
        let cutoff = active_cutoff(Utc::now(), active_window);
        let count = |sql: &str, args: &[&dyn rusqlite::ToSql]| -> Result<u64> {
            let n: i64 = self.conn.query_row(sql, args, |row| row.get(0))
                .context("Failed to count rows")?;
            Ok(n as u64)
        };

        Ok(RegistryStats {
            total_servers: count("SELECT COUNT(*) FROM servers", &[])?,
            active_servers: count("SELECT COUNT(*) FROM servers WHERE last_seen > ?1", &[&cutoff])?,
            favorite_servers: count("SELECT COUNT(*) FROM servers WHERE is_favorite = 1", &[])?,
            total_history: count("SELECT COUNT(*) FROM server_history", &[])?,
            db_path: self.path.clone(),
        })
    }

    fn query_servers<P: rusqlite::Params>(&self, filter: &str, args: P) -> Result<Vec<ServerRecord>> {
        let sql = format!(
            "SELECT {} FROM servers WHERE {} ORDER BY last_seen DESC",
            SERVER_COLUMNS, filter
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare query")?;

        let servers = stmt
            .query_map(args, row_to_server)
            .context("Failed to query servers")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect servers")?;

        Ok(servers)
    }
}

fn query_server(conn: &Connection, id: &str) -> Result<Option<ServerRecord>> {
    let sql = format!("SELECT {} FROM servers WHERE id = ?1", SERVER_COLUMNS);
    conn.query_row(&sql, params![id], row_to_server)
        .optional()
        .context("Failed to query server")
}

fn append_history(
    conn: &Connection,
    server_id: &str,
    action: HistoryAction,
    old_value: Option<&str>,
    new_value: Option<&str>,
    timestamp: i64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO server_history (server_id, action, old_value, new_value, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![server_id, action.as_str(), old_value, new_value, timestamp],
    )
    .with_context(|| format!("Failed to record {} for {}", action, server_id))?;

    Ok(conn.last_insert_rowid())
}

/// Epoch millis a record must be seen after to count as active.
/// Windows beyond the representable range saturate instead of wrapping.
fn active_cutoff(now: DateTime<Utc>, window: Duration) -> i64 {
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    now.timestamp_millis().saturating_sub(window_ms)
}

/// Empty strings are stored as NULL
fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

fn millis_at(row: &Row, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let millis: i64 = row.get(idx)?;
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn row_to_server(row: &Row) -> Result<ServerRecord, rusqlite::Error> {
    Ok(ServerRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        ip: row.get(2)?,
        port: row.get::<_, u16>(3)?,
        version: row.get(4)?,
        location: row.get(5)?,
        server_type: row.get(6)?,
        last_seen: millis_at(row, 7)?,
        first_discovered: millis_at(row, 8)?,
        is_favorite: row.get(9)?,
        notes: row.get(10)?,
        created_at: millis_at(row, 11)?,
        updated_at: millis_at(row, 12)?,
    })
}

fn row_to_history(row: &Row) -> Result<HistoryEntry, rusqlite::Error> {
    let action: String = row.get(2)?;
    let action = action.parse::<HistoryAction>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::new(e),
        ))?;

    Ok(HistoryEntry {
        id: row.get(0)?,
        server_id: row.get(1)?,
        action,
        old_value: row.get(3)?,
        new_value: row.get(4)?,
        timestamp: millis_at(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    fn candidate(id: &str, ip: &str) -> ServerCandidate {
        ServerCandidate {
            id: id.to_string(),
            name: format!("server {}", id),
            ip: ip.to_string(),
            port: 8080,
            version: Some("2.1.0".to_string()),
            location: None,
            server_type: None,
            last_seen: Utc::now(),
            is_favorite: false,
            notes: None,
        }
    }

    #[test]
    fn test_first_upsert_inserts_and_records_discovery() {
        let db = RegistryDb::open_in_memory().unwrap();

        let stored = db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();
        assert_eq!(stored.ip, "10.0.0.1");
        assert!(!stored.is_favorite);
        assert_eq!(stored.version.as_deref(), Some("2.1.0"));

        let history = db.history_for("A", 50).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, HistoryAction::Discovered);
        assert_eq!(history[0].old_value, None);
        assert_eq!(history[0].new_value.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_first_discovered_is_immutable() {
        let db = RegistryDb::open_in_memory().unwrap();
        let first = db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();

        std::thread::sleep(Duration::from_millis(5));
        let mut again = candidate("A", "10.0.0.9");
        again.name = "renamed".to_string();
        let second = db.upsert_server(&again).unwrap();

        assert_eq!(second.first_discovered, first.first_discovered);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.name, "renamed");
        assert!(second.updated_at >= first.updated_at);
    }

    #[test]
    fn test_ip_change_appends_one_history_entry() {
        let db = RegistryDb::open_in_memory().unwrap();
        db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();
        db.upsert_server(&candidate("A", "10.0.0.2")).unwrap();

        assert_eq!(db.get_server("A").unwrap().unwrap().ip, "10.0.0.2");

        let history = db.history_for("A", 50).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].action, HistoryAction::ModifiedIp);
        assert_eq!(history[0].old_value.as_deref(), Some("10.0.0.1"));
        assert_eq!(history[0].new_value.as_deref(), Some("10.0.0.2"));
        assert_eq!(history[1].action, HistoryAction::Discovered);
        assert_eq!(history[1].new_value.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_same_ip_appends_nothing() {
        let db = RegistryDb::open_in_memory().unwrap();
        db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();
        db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();
        db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();

        assert_eq!(db.history_for("A", 50).unwrap().len(), 1);
    }

    #[test]
    fn test_upsert_preserves_user_fields() {
        let db = RegistryDb::open_in_memory().unwrap();
        db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();

        assert_eq!(db.toggle_favorite("A").unwrap(), Some(true));
        assert!(db.update_notes("A", "maintenance window").unwrap());

        let merged = db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();
        assert!(merged.is_favorite);
        assert_eq!(merged.notes.as_deref(), Some("maintenance window"));

        let stored = db.get_server("A").unwrap().unwrap();
        assert_eq!(stored, merged);
    }

    #[test]
    fn test_upsert_replaces_notes_only_when_supplied() {
        let db = RegistryDb::open_in_memory().unwrap();
        db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();
        db.update_notes("A", "old").unwrap();

        let mut blank = candidate("A", "10.0.0.1");
        blank.notes = Some(String::new());
        assert_eq!(db.upsert_server(&blank).unwrap().notes.as_deref(), Some("old"));

        let mut explicit = candidate("A", "10.0.0.1");
        explicit.notes = Some("new".to_string());
        assert_eq!(db.upsert_server(&explicit).unwrap().notes.as_deref(), Some("new"));
    }

    #[test]
    fn test_upsert_ignores_candidate_favorite_on_refresh() {
        let db = RegistryDb::open_in_memory().unwrap();
        db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();

        let mut fav = candidate("A", "10.0.0.1");
        fav.is_favorite = true;
        assert!(!db.upsert_server(&fav).unwrap().is_favorite);

        let mut new_fav = candidate("B", "10.0.0.2");
        new_fav.is_favorite = true;
        assert!(db.upsert_server(&new_fav).unwrap().is_favorite);
    }

    #[test]
    fn test_get_all_orders_by_last_seen() {
        let db = RegistryDb::open_in_memory().unwrap();
        for (id, seen) in [("old", 1_000), ("new", 3_000), ("mid", 2_000)] {
            let mut c = candidate(id, "10.0.0.1");
            c.last_seen = at(seen);
            db.upsert_server(&c).unwrap();
        }

        let ids: Vec<String> = db.get_all_servers().unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[test]
    fn test_active_window_excludes_boundary() {
        let db = RegistryDb::open_in_memory().unwrap();
        let now = 100_000;
        for (id, seen) in [("inside", now - 14_999), ("boundary", now - 15_000), ("outside", now - 16_000)] {
            let mut c = candidate(id, "10.0.0.1");
            c.last_seen = at(seen);
            db.upsert_server(&c).unwrap();
        }

        let active = db.get_active_servers_at(Duration::from_millis(15_000), at(now)).unwrap();
        let ids: Vec<&str> = active.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["inside"]);
        assert_eq!(db.get_all_servers().unwrap().len(), 3);
    }

    #[test]
    fn test_huge_active_window_includes_everything() {
        let db = RegistryDb::open_in_memory().unwrap();
        let mut old = candidate("old", "10.0.0.1");
        old.last_seen = at(0);
        db.upsert_server(&old).unwrap();
        db.upsert_server(&candidate("fresh", "10.0.0.2")).unwrap();

        for window in [Duration::from_millis(u64::MAX), Duration::from_millis(1 << 63), Duration::MAX] {
            assert_eq!(db.get_active_servers_at(window, at(100_000)).unwrap().len(), 2);
            assert_eq!(db.get_active_servers(window).unwrap().len(), 2);
            assert_eq!(db.stats(window).unwrap().active_servers, 2);
        }
    }

    #[test]
    fn test_purge_with_huge_retention_keeps_history() {
        let db = RegistryDb::open_in_memory().unwrap();
        db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();

        assert_eq!(db.purge_history_older_than_days(u32::MAX).unwrap(), 0);
        assert_eq!(db.history_for("A", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_expired_server_stays_in_registry() {
        let db = RegistryDb::open_in_memory().unwrap();
        let mut b = candidate("B", "10.0.0.3");
        b.last_seen = at(0);
        db.upsert_server(&b).unwrap();

        let active = db.get_active_servers_at(Duration::from_millis(15_000), at(16_000)).unwrap();
        assert!(active.is_empty());
        assert!(db.get_all_servers().unwrap().iter().any(|s| s.id == "B"));
    }

    #[test]
    fn test_favorites() {
        let db = RegistryDb::open_in_memory().unwrap();
        db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();
        db.upsert_server(&candidate("B", "10.0.0.2")).unwrap();
        db.toggle_favorite("B").unwrap();

        let favorites = db.get_favorite_servers().unwrap();
        assert_eq!(favorites.len(), 1);
        assert_eq!(favorites[0].id, "B");
    }

    #[test]
    fn test_toggle_favorite_is_its_own_inverse() {
        let db = RegistryDb::open_in_memory().unwrap();
        db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();

        assert_eq!(db.toggle_favorite("A").unwrap(), Some(true));
        assert_eq!(db.toggle_favorite("A").unwrap(), Some(false));
        assert!(!db.get_server("A").unwrap().unwrap().is_favorite);
    }

    #[test]
    fn test_unknown_ids_fail_without_error() {
        let db = RegistryDb::open_in_memory().unwrap();

        assert_eq!(db.toggle_favorite("nonexistent").unwrap(), None);
        assert!(!db.update_ip("nonexistent", "10.0.0.1").unwrap());
        assert!(!db.update_notes("nonexistent", "x").unwrap());
        assert!(!db.delete_server("nonexistent").unwrap());
        assert!(db.get_server("nonexistent").unwrap().is_none());
        assert!(db.all_history(100).unwrap().is_empty());
    }

    #[test]
    fn test_update_ip_records_history() {
        let db = RegistryDb::open_in_memory().unwrap();
        db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();

        assert!(db.update_ip("A", "192.168.1.5").unwrap());
        let stored = db.get_server("A").unwrap().unwrap();
        assert_eq!(stored.ip, "192.168.1.5");
        assert_eq!(stored.name, "server A");

        let history = db.history_for("A", 50).unwrap();
        assert_eq!(history[0].action, HistoryAction::ModifiedIp);
        assert_eq!(history[0].old_value.as_deref(), Some("10.0.0.1"));
        assert_eq!(history[0].new_value.as_deref(), Some("192.168.1.5"));
    }

    #[test]
    fn test_update_notes_touches_only_notes() {
        let db = RegistryDb::open_in_memory().unwrap();
        let before = db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();

        db.update_notes("A", "rack 4").unwrap();
        let after = db.get_server("A").unwrap().unwrap();

        assert_eq!(after.notes.as_deref(), Some("rack 4"));
        assert_eq!(after.ip, before.ip);
        assert_eq!(after.is_favorite, before.is_favorite);
        assert_eq!(after.last_seen, before.last_seen);
    }

    #[test]
    fn test_delete_cascades_to_history() {
        let db = RegistryDb::open_in_memory().unwrap();
        db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();
        db.upsert_server(&candidate("A", "10.0.0.2")).unwrap();
        db.upsert_server(&candidate("B", "10.0.0.3")).unwrap();

        assert!(db.delete_server("A").unwrap());
        assert!(db.get_server("A").unwrap().is_none());
        assert!(db.history_for("A", 50).unwrap().is_empty());
        assert_eq!(db.all_history(100).unwrap().len(), 1);
        assert!(!db.delete_server("A").unwrap());
    }

    #[test]
    fn test_rediscovery_after_delete_starts_fresh() {
        let db = RegistryDb::open_in_memory().unwrap();
        db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();
        db.toggle_favorite("A").unwrap();
        db.delete_server("A").unwrap();

        let again = db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();
        assert!(!again.is_favorite);
        let history = db.history_for("A", 50).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, HistoryAction::Discovered);
    }

    #[test]
    fn test_history_limit_and_order() {
        let db = RegistryDb::open_in_memory().unwrap();
        db.upsert_server(&candidate("A", "10.0.0.0")).unwrap();
        for i in 1..=5 {
            db.update_ip("A", &format!("10.0.0.{}", i)).unwrap();
        }

        let history = db.history_for("A", 3).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].new_value.as_deref(), Some("10.0.0.5"));
        assert_eq!(history[2].new_value.as_deref(), Some("10.0.0.3"));
        assert!(history.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

        assert_eq!(db.all_history(100).unwrap().len(), 6);
        assert_eq!(db.all_history(2).unwrap().len(), 2);
    }

    #[test]
    fn test_purge_removes_only_older_entries() {
        let db = RegistryDb::open_in_memory().unwrap();
        db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();
        for (ts, ip) in [(1_000, "a"), (2_000, "b"), (3_000, "c")] {
            append_history(&db.conn, "A", HistoryAction::Updated, None, Some(ip), ts).unwrap();
        }

        let removed = db.purge_history_older_than(at(2_000)).unwrap();
        assert_eq!(removed, 1);

        let remaining: Vec<Option<String>> = db
            .all_history(100)
            .unwrap()
            .into_iter()
            .map(|h| h.new_value)
            .collect();
        assert!(remaining.contains(&Some("b".to_string())));
        assert!(remaining.contains(&Some("c".to_string())));
        assert!(!remaining.contains(&Some("a".to_string())));
        assert!(db.get_server("A").unwrap().is_some());
    }

    #[test]
    fn test_retention_in_days_keeps_recent_history() {
        let db = RegistryDb::open_in_memory().unwrap();
        db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();
        let stale = (Utc::now() - chrono::Duration::days(45)).timestamp_millis();
        append_history(&db.conn, "A", HistoryAction::Connected, None, None, stale).unwrap();

        assert_eq!(db.purge_history_older_than_days(30).unwrap(), 1);
        assert_eq!(db.history_for("A", 50).unwrap().len(), 1);
    }

    #[test]
    fn test_stats() {
        let db = RegistryDb::open_in_memory().unwrap();
        db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();
        let mut gone = candidate("B", "10.0.0.2");
        gone.last_seen = at(0);
        db.upsert_server(&gone).unwrap();
        db.toggle_favorite("B").unwrap();

        let stats = db.stats(Duration::from_secs(15)).unwrap();
        assert_eq!(stats.total_servers, 2);
        assert_eq!(stats.active_servers, 1);
        assert_eq!(stats.favorite_servers, 1);
        assert_eq!(stats.total_history, 2);
        assert_eq!(stats.db_path, ":memory:");
    }

    #[test]
    fn test_reopen_file_keeps_records() {
        let dir = std::env::temp_dir().join(format!("scoutd-test-{}", std::process::id()));
        let path = dir.join("servers.db");

        {
            let db = RegistryDb::open(&path).unwrap();
            db.upsert_server(&candidate("A", "10.0.0.1")).unwrap();
            db.update_notes("A", "kept").unwrap();
        }

        let db = RegistryDb::open(&path).unwrap();
        let stored = db.get_server("A").unwrap().unwrap();
        assert_eq!(stored.notes.as_deref(), Some("kept"));
        assert_eq!(db.history_for("A", 50).unwrap().len(), 1);

        drop(db);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
