//! Game-server stats store
//!
//! The coordinator never talks to game servers directly: it picks servers purely
//! from what this store reports, and game servers publish their own state and
//! connection counts into it. Two backends exist:
//!
//! - [`MemoryStats`]: process-local, used by tests and single-process setups
//! - [`JsonFileStats`]: a JSON file shared by the matchmaker and the game-server
//!   processes it spawns, re-read periodically by [`StatsStore::run`]
//!
//! The backend is chosen once at startup with [`open_store`].

mod json;
mod memory;

pub use json::JsonFileStats;
pub use memory::MemoryStats;

use crate::cancel::CancelToken;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stats file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("stats file is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Lifecycle state of a game server as published in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameServerState {
    Initializing,
    Ready,
    Idle,
    Closed,
}

impl fmt::Display for GameServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GameServerState::Initializing => "init",
            GameServerState::Ready => "ready",
            GameServerState::Idle => "idle",
            GameServerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One game server as known to the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameServerRecord {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub state: GameServerState,
    pub connections: u32,
    pub connections_added: u32,
    pub connections_removed: u32,
    pub load: f32,
}

impl GameServerRecord {
    /// A freshly registered server: initializing, no connections, no load
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            state: GameServerState::Initializing,
            connections: 0,
            connections_added: 0,
            connections_removed: 0,
            load: 0.0,
        }
    }

    /// `host:port` connection string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for GameServerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Server({}): addr={} conns={} load={:.2} state={}",
            self.id,
            self.addr(),
            self.connections,
            self.load,
            self.state
        )
    }
}

/// Connection counters summed over every server in the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub connections: u32,
    pub connections_added: u32,
    pub connections_removed: u32,
}

/// Capability set the matchmaker and game servers need from a stats backend
///
/// Implementations must be safe to share between connection tasks.
#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Option<GameServerRecord>;

    async fn get_all(&self) -> Result<Vec<GameServerRecord>, StoreError>;

    /// Ready servers whose load is below `max_load`, least loaded first
    ///
    /// Servers with equal load keep the store's own order.
    async fn get_servers_by_utilization(
        &self,
        max_load: f32,
    ) -> Result<Vec<GameServerRecord>, StoreError>;

    /// Inserts the record, or replaces the one with the same id
    async fn update(&self, record: GameServerRecord) -> Result<(), StoreError>;

    async fn get_total_connection_stats(&self) -> ConnectionStats;

    async fn get_server_count(&self) -> usize;

    /// Background maintenance until `cancel` fires
    async fn run(&self, cancel: CancelToken);
}

/// Opens the JSON-file backend when a path is given, the in-memory one otherwise
///
/// The file is truncated to an empty store when `clear` is set; the matchmaker
/// does this on startup so stale servers from a previous run are never selected.
pub async fn open_store(
    path: Option<&Path>,
    clear: bool,
) -> Result<Arc<dyn StatsStore>, StoreError> {
    match path {
        Some(path) if clear => Ok(Arc::new(JsonFileStats::create_empty(path).await?)),
        Some(path) => Ok(Arc::new(JsonFileStats::open(path).await?)),
        None => Ok(Arc::new(MemoryStats::new())),
    }
}

fn rank_by_utilization<'a>(
    records: impl Iterator<Item = &'a GameServerRecord>,
    max_load: f32,
) -> Vec<GameServerRecord> {
    let mut ranked: Vec<GameServerRecord> = records
        .filter(|r| r.state == GameServerState::Ready && r.load < max_load)
        .cloned()
        .collect();

    // Stable sort: equal loads stay in store order
    ranked.sort_by(|a, b| a.load.total_cmp(&b.load));
    ranked
}

fn total_connections<'a>(records: impl Iterator<Item = &'a GameServerRecord>) -> ConnectionStats {
    records.fold(ConnectionStats::default(), |mut acc, r| {
        acc.connections += r.connections;
        acc.connections_added += r.connections_added;
        acc.connections_removed += r.connections_removed;
        acc
    })
}

fn upsert(records: &mut Vec<GameServerRecord>, record: GameServerRecord) {
    match records.iter_mut().find(|r| r.id == record.id) {
        Some(existing) => *existing = record,
        None => records.push(record),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, state: GameServerState, load: f32) -> GameServerRecord {
        let mut record = GameServerRecord::new(id, "127.0.0.1", 9000);
        record.state = state;
        record.load = load;
        record
    }

    #[test]
    fn test_new_record_defaults() {
        let record = GameServerRecord::new("s1", "10.0.0.2", 7000);
        assert_eq!(record.state, GameServerState::Initializing);
        assert_eq!(record.connections, 0);
        assert_eq!(record.addr(), "10.0.0.2:7000");
    }

    #[test]
    fn test_rank_filters_and_orders() {
        let records = vec![
            record("busy", GameServerState::Ready, 0.95),
            record("b", GameServerState::Ready, 0.4),
            record("booting", GameServerState::Initializing, 0.0),
            record("a", GameServerState::Ready, 0.1),
            record("idle", GameServerState::Idle, 0.0),
            record("c", GameServerState::Ready, 0.4),
            record("closed", GameServerState::Closed, 0.0),
        ];

        let ranked = rank_by_utilization(records.iter(), 0.9);
        let ids: Vec<&str> = ranked.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_total_connections() {
        let mut a = record("a", GameServerState::Ready, 0.0);
        a.connections = 2;
        a.connections_added = 5;
        a.connections_removed = 3;
        let mut b = record("b", GameServerState::Ready, 0.0);
        b.connections = 1;
        b.connections_added = 1;

        let totals = total_connections([a, b].iter());
        assert_eq!(
            totals,
            ConnectionStats {
                connections: 3,
                connections_added: 6,
                connections_removed: 3,
            }
        );
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let mut records = vec![record("a", GameServerState::Initializing, 0.0)];
        upsert(&mut records, record("a", GameServerState::Ready, 0.0));
        upsert(&mut records, record("b", GameServerState::Ready, 0.0));

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].state, GameServerState::Ready);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&GameServerState::Initializing).unwrap();
        assert_eq!(json, "\"initializing\"");
        assert_eq!(GameServerState::Idle.to_string(), "idle");
    }
}
