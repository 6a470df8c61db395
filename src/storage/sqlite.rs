use super::{HardState, Storage, StorageResult};
use crate::consensus::algorithms::raft::{LogEntry, LogIndex};
use crate::error::StorageError;
use crate::state::{ReplicaState, VersionVector};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, info};

/// SQLite-backed storage with a single shared connection
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path` and initialize its schema
    pub fn open(path: &str) -> StorageResult<Self> {
        let storage = SqliteStorage {
            conn: Arc::new(Mutex::new(Connection::open(path)?)),
        };
        storage.init()?;
        info!(path = %path, "Storage: SQLite database opened");
        Ok(storage)
    }

    pub fn in_memory() -> StorageResult<Self> {
        let storage = SqliteStorage {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        };
        storage.init()?;
        Ok(storage)
    }

    fn init(&self) -> StorageResult<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS raft_hard_state (
                node          TEXT PRIMARY KEY,
                current_term  INTEGER NOT NULL,
                voted_for     TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS raft_log (
                node          TEXT NOT NULL,
                log_index     INTEGER NOT NULL,
                term          INTEGER NOT NULL,
                command_json  TEXT NOT NULL,
                created_at    INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY (node, log_index)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sync_checkpoint (
                owner         TEXT NOT NULL,
                peer          TEXT NOT NULL,
                vector_json   TEXT NOT NULL,
                PRIMARY KEY (owner, peer)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS replica_snapshot (
                owner         TEXT PRIMARY KEY,
                state_json    TEXT NOT NULL,
                saved_at      INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_raft_log_term ON raft_log(node, term)",
            [],
        )?;

        Ok(())
    }
}

impl Storage for SqliteStorage {
    fn load_hard_state(&self, node: &str) -> StorageResult<Option<HardState>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT current_term, voted_for FROM raft_hard_state WHERE node = ?1",
                [node],
                |row| {
                    let term: i64 = row.get(0)?;
                    let voted_for: Option<String> = row.get(1)?;
                    Ok(HardState {
                        current_term: term as u64,
                        voted_for,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    fn save_hard_state(&self, node: &str, state: &HardState) -> StorageResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO raft_hard_state (node, current_term, voted_for) VALUES (?1, ?2, ?3)
             ON CONFLICT(node) DO UPDATE SET current_term = excluded.current_term,
                                             voted_for = excluded.voted_for",
            params![node, state.current_term as i64, state.voted_for],
        )?;
        debug!(node = %node, term = state.current_term, "Storage: hard state saved");
        Ok(())
    }

    /// Entries are written in one transaction, replacing any at the same index
    fn append_entries(&self, node: &str, entries: &[LogEntry]) -> StorageResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for entry in entries {
            let command_json = serde_json::to_string(&entry.command)?;
            tx.execute(
                "INSERT OR REPLACE INTO raft_log (node, log_index, term, command_json)
                 VALUES (?1, ?2, ?3, ?4)",
                params![node, entry.index as i64, entry.term as i64, command_json],
            )?;
        }
        tx.commit()?;
        debug!(node = %node, count = entries.len(), "Storage: log entries appended");
        Ok(())
    }

    fn truncate_log(&self, node: &str, from: LogIndex) -> StorageResult<()> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM raft_log WHERE node = ?1 AND log_index >= ?2",
            params![node, from as i64],
        )?;
        debug!(node = %node, from, removed, "Storage: log truncated");
        Ok(())
    }

    fn load_log(&self, node: &str) -> StorageResult<Vec<LogEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT log_index, term, command_json FROM raft_log
             WHERE node = ?1 ORDER BY log_index ASC",
        )?;
        let rows = stmt.query_map([node], |row| {
            let index: i64 = row.get(0)?;
            let term: i64 = row.get(1)?;
            let command_json: String = row.get(2)?;
            Ok((index, term, command_json))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (index, term, command_json) = row?;
            entries.push(LogEntry {
                term: term as u64,
                index: index as u64,
                command: serde_json::from_str(&command_json)?,
            });
        }
        Ok(entries)
    }

    fn save_checkpoint(
        &self,
        owner: &str,
        peer: &str,
        vector: &VersionVector,
    ) -> StorageResult<()> {
        let vector_json = serde_json::to_string(vector)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO sync_checkpoint (owner, peer, vector_json) VALUES (?1, ?2, ?3)",
            params![owner, peer, vector_json],
        )?;
        Ok(())
    }

    fn load_checkpoint(&self, owner: &str, peer: &str) -> StorageResult<Option<VersionVector>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT vector_json FROM sync_checkpoint WHERE owner = ?1 AND peer = ?2",
                [owner, peer],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(StorageError::from))
            .transpose()
    }

    fn save_snapshot(&self, state: &ReplicaState) -> StorageResult<()> {
        let state_json = serde_json::to_string(state)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO replica_snapshot (owner, state_json) VALUES (?1, ?2)",
            params![state.owner, state_json],
        )?;
        debug!(owner = %state.owner, entries = state.len(), "Storage: snapshot saved");
        Ok(())
    }

    fn load_snapshot(&self, owner: &str) -> StorageResult<Option<ReplicaState>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM replica_snapshot WHERE owner = ?1",
                [owner],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(StorageError::from))
            .transpose()
    }
}
