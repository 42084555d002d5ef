//! Fleet management: starting game servers and waiting for them to come up
//!
//! The coordinator only needs three things from a fleet: create a server, wait
//! until it reports Ready, and resolve its connection string. [`LocalFleet`]
//! does this with child processes on the same machine; other backends plug in
//! through [`FleetManager`].

use crate::cancel::CancelToken;
use crate::stats::{GameServerState, StatsStore, StoreError};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::Instant;

/// Delay between store reads while waiting for a server to become ready
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub const DEFAULT_STATS_PATH: &str = "game-server-stats.json";

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("failed to start game server: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("game servers need a shared stats file to report readiness")]
    NoSharedStats,

    #[error("fleet is at capacity ({0} servers)")]
    CapacityExhausted(usize),

    #[error("game server {0} closed before becoming ready")]
    ClosedBeforeReady(String),

    #[error("game server {id} not ready after {waited:?}")]
    ReadyTimeout { id: String, waited: Duration },

    #[error("unknown game server {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Capability set for provisioning game servers
#[async_trait]
pub trait FleetManager: Send + Sync {
    /// Starts a new game server and returns its id
    async fn create_new_server(&self, cancel: &CancelToken) -> Result<String, FleetError>;

    /// Resolves once the server reports Ready
    async fn wait_for_ready(&self, cancel: &CancelToken, id: &str) -> Result<(), FleetError>;

    /// `host:port` of a known server
    async fn get_connection_string(&self, id: &str) -> Result<String, FleetError>;

    /// Reconciles the store with servers that are gone; returns their ids
    async fn reap_dead_instances(&self) -> Result<Vec<String>, FleetError> {
        Ok(Vec::new())
    }

    /// Stops every server this fleet started
    async fn shutdown(&self) {}
}

/// Polls `store` until server `id` is Ready, Closed, or `timeout` elapses
pub async fn wait_until_ready(
    store: &dyn StatsStore,
    cancel: &CancelToken,
    id: &str,
    timeout: Duration,
) -> Result<(), FleetError> {
    let started = Instant::now();

    loop {
        if let Some(record) = store.get_by_id(id).await {
            match record.state {
                GameServerState::Ready => return Ok(()),
                GameServerState::Closed => return Err(FleetError::ClosedBeforeReady(id.to_string())),
                _ => debug!("Waiting for server {} ({})", id, record.state),
            }
        }

        if started.elapsed() >= timeout {
            return Err(FleetError::ReadyTimeout {
                id: id.to_string(),
                waited: timeout,
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(FleetError::Cancelled),
            _ = tokio::time::sleep(READY_POLL_INTERVAL) => {}
        }
    }
}

/// Looks up `host:port` for server `id` in the store
pub async fn connection_string(store: &dyn StatsStore, id: &str) -> Result<String, FleetError> {
    store
        .get_by_id(id)
        .await
        .map(|record| record.addr())
        .ok_or_else(|| FleetError::NotFound(id.to_string()))
}

#[derive(Debug, Clone)]
pub struct LocalFleetConfig {
    /// Game-server executable
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Stats file handed to children through `STATS_JSON`; required, since a
    /// child's in-memory store is invisible to the matchmaker
    pub stats_path: Option<PathBuf>,
    pub ready_timeout: Duration,
    pub max_servers: usize,
}

impl Default for LocalFleetConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("dummy_server"),
            args: Vec::new(),
            stats_path: Some(PathBuf::from(DEFAULT_STATS_PATH)),
            ready_timeout: Duration::from_secs(30),
            max_servers: 16,
        }
    }
}

/// Fleet of game servers running as child processes
///
/// Children get their id in `ID` and the shared stats file in `STATS_JSON`,
/// then publish their own record; readiness is read back from the store.
pub struct LocalFleet {
    config: LocalFleetConfig,
    stats: Arc<dyn StatsStore>,
    next_id: AtomicU64,
    children: Mutex<HashMap<String, Child>>,
}

impl LocalFleet {
    pub fn new(config: LocalFleetConfig, stats: Arc<dyn StatsStore>) -> Self {
        Self {
            config,
            stats,
            next_id: AtomicU64::new(0),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn running(&self) -> usize {
        self.lock_children().len()
    }

    fn lock_children(&self) -> std::sync::MutexGuard<'_, HashMap<String, Child>> {
        match self.children.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl FleetManager for LocalFleet {
    async fn create_new_server(&self, cancel: &CancelToken) -> Result<String, FleetError> {
        if cancel.is_cancelled() {
            return Err(FleetError::Cancelled);
        }

        let stats_path = self
            .config
            .stats_path
            .as_ref()
            .ok_or(FleetError::NoSharedStats)?;

        let mut children = self.lock_children();
        if children.len() >= self.config.max_servers {
            return Err(FleetError::CapacityExhausted(children.len()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .env("ID", &id)
            .env("STATS_JSON", stats_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let child = command.spawn().map_err(FleetError::Spawn)?;
        info!(
            "Started game server {} ({} pid {:?})",
            id,
            self.config.program.display(),
            child.id()
        );
        children.insert(id.clone(), child);

        Ok(id)
    }

    async fn wait_for_ready(&self, cancel: &CancelToken, id: &str) -> Result<(), FleetError> {
        wait_until_ready(self.stats.as_ref(), cancel, id, self.config.ready_timeout).await
    }

    async fn get_connection_string(&self, id: &str) -> Result<String, FleetError> {
        connection_string(self.stats.as_ref(), id).await
    }

    async fn reap_dead_instances(&self) -> Result<Vec<String>, FleetError> {
        let exited: Vec<String> = {
            let mut children = self.lock_children();
            let mut exited = Vec::new();

            children.retain(|id, child| match child.try_wait() {
                Ok(Some(status)) => {
                    info!("Game server {} exited with {}", id, status);
                    exited.push(id.clone());
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!("Could not poll game server {}: {}", id, e);
                    true
                }
            });

            exited
        };

        for id in &exited {
            if let Some(mut record) = self.stats.get_by_id(id).await {
                if record.state != GameServerState::Closed {
                    warn!("Game server {} exited without closing, marking it closed", id);
                    record.state = GameServerState::Closed;
                    self.stats.update(record).await?;
                }
            }
        }

        Ok(exited)
    }

    async fn shutdown(&self) {
        let mut children = self.lock_children();
        for (id, child) in children.iter_mut() {
            if let Err(e) = child.start_kill() {
                error!("Failed to stop game server {}: {}", id, e);
            }
        }
        children.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{GameServerRecord, MemoryStats};

    fn ready_record(id: &str) -> GameServerRecord {
        let mut record = GameServerRecord::new(id, "127.0.0.1", 9000);
        record.state = GameServerState::Ready;
        record
    }

    #[tokio::test]
    async fn test_wait_until_ready_sees_later_update() {
        let store = Arc::new(MemoryStats::new());
        store
            .update(GameServerRecord::new("s1", "127.0.0.1", 9000))
            .await
            .unwrap();

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                store.update(ready_record("s1")).await.unwrap();
            })
        };

        wait_until_ready(store.as_ref(), &CancelToken::new(), "s1", Duration::from_secs(2))
            .await
            .unwrap();
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_until_ready_reports_closed() {
        let mut record = ready_record("s1");
        record.state = GameServerState::Closed;
        let store = MemoryStats::with_records(vec![record]);

        let result = wait_until_ready(&store, &CancelToken::new(), "s1", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(FleetError::ClosedBeforeReady(id)) if id == "s1"));
    }

    #[tokio::test]
    async fn test_wait_until_ready_times_out() {
        let store = MemoryStats::new();
        let result =
            wait_until_ready(&store, &CancelToken::new(), "ghost", Duration::from_millis(100)).await;
        assert!(matches!(result, Err(FleetError::ReadyTimeout { .. })));
    }

    #[tokio::test]
    async fn test_wait_until_ready_honours_cancel() {
        let store = MemoryStats::new();
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = wait_until_ready(&store, &cancel, "ghost", Duration::from_secs(10)).await;
        assert!(matches!(result, Err(FleetError::Cancelled)));
    }

    #[tokio::test]
    async fn test_connection_string_lookup() {
        let store = MemoryStats::with_records(vec![ready_record("s1")]);
        assert_eq!(connection_string(&store, "s1").await.unwrap(), "127.0.0.1:9000");
        assert!(matches!(
            connection_string(&store, "nope").await,
            Err(FleetError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_local_fleet_reports_spawn_failure() {
        let config = LocalFleetConfig {
            program: PathBuf::from("/nonexistent/game-server-binary"),
            ..LocalFleetConfig::default()
        };
        let fleet = LocalFleet::new(config, Arc::new(MemoryStats::new()));

        let result = fleet.create_new_server(&CancelToken::new()).await;
        assert!(matches!(result, Err(FleetError::Spawn(_))));
        assert_eq!(fleet.running(), 0);
    }

    #[tokio::test]
    async fn test_local_fleet_capacity() {
        let config = LocalFleetConfig {
            max_servers: 0,
            ..LocalFleetConfig::default()
        };
        let fleet = LocalFleet::new(config, Arc::new(MemoryStats::new()));

        let result = fleet.create_new_server(&CancelToken::new()).await;
        assert!(matches!(result, Err(FleetError::CapacityExhausted(0))));
    }

    #[tokio::test]
    async fn test_local_fleet_requires_shared_stats_file() {
        let config = LocalFleetConfig {
            stats_path: None,
            ..LocalFleetConfig::default()
        };
        let fleet = LocalFleet::new(config, Arc::new(MemoryStats::new()));

        let result = fleet.create_new_server(&CancelToken::new()).await;
        assert!(matches!(result, Err(FleetError::NoSharedStats)));
        assert_eq!(fleet.running(), 0);
    }
}
