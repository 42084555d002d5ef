//! Game-server lifecycle: Initializing → Ready ⇄ Idle → Closed
//!
//! A game server owns its own record and is the only writer of it. The
//! coordinator only ever sees the state through the stats store, so every
//! change is persisted before it is committed in memory.
//!
//! - Initializing → Ready once the listener is bound
//! - Ready → Idle when an idle check finds no connections
//! - Idle → Closed when the next idle check still finds none
//! - anything but Closed → Ready when a connection is accepted
//! - Closed is terminal

use crate::cancel::CancelToken;
use crate::stats::{GameServerRecord, GameServerState, StatsStore, StoreError};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Reference interval between idle checks
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(30);

/// Load each open connection contributes to a server
pub const LOAD_PER_CONNECTION: f32 = 0.05;

/// Pure lifecycle state machine over one record
#[derive(Debug, Clone)]
pub struct ServerLifecycle {
    record: GameServerRecord,
}

impl ServerLifecycle {
    pub fn new(record: GameServerRecord) -> Self {
        Self { record }
    }

    pub fn record(&self) -> &GameServerRecord {
        &self.record
    }

    pub fn state(&self) -> GameServerState {
        self.record.state
    }

    /// Initializing → Ready; returns whether the state changed
    pub fn mark_ready(&mut self) -> bool {
        if self.record.state == GameServerState::Initializing {
            self.record.state = GameServerState::Ready;
            return true;
        }
        false
    }

    /// Records an accepted connection and pulls the server back to Ready
    ///
    /// # Panics
    ///
    /// Panics if the server is already Closed: nothing may be attributed to a
    /// closed server, and a caller doing so has lost track of its own state.
    pub fn connection_added(&mut self) {
        assert_ne!(
            self.record.state,
            GameServerState::Closed,
            "connection accepted on closed server {}",
            self.record.id
        );

        self.record.connections += 1;
        self.record.connections_added += 1;
        self.record.load += LOAD_PER_CONNECTION;
        self.record.state = GameServerState::Ready;
    }

    pub fn connection_removed(&mut self) {
        if self.record.connections == 0 {
            debug!("Server {} removed a connection it never counted", self.record.id);
            return;
        }

        self.record.connections -= 1;
        self.record.connections_removed += 1;
        self.record.load = (self.record.load - LOAD_PER_CONNECTION).max(0.0);
    }

    /// Applies one idle-timer tick, returning the new state if it changed
    pub fn idle_check(&mut self) -> Option<GameServerState> {
        if self.record.connections != 0 {
            return None;
        }

        let next = match self.record.state {
            GameServerState::Ready => GameServerState::Idle,
            GameServerState::Idle => GameServerState::Closed,
            _ => return None,
        };

        self.record.state = next;
        Some(next)
    }

    /// Forces the terminal state, e.g. on shutdown
    pub fn close(&mut self) -> bool {
        if self.record.state == GameServerState::Closed {
            return false;
        }
        self.record.state = GameServerState::Closed;
        true
    }
}

/// Lifecycle whose every change is written to a stats store first
pub struct LifecycleHandle {
    lifecycle: Mutex<ServerLifecycle>,
    store: Arc<dyn StatsStore>,
}

impl LifecycleHandle {
    /// Publishes the initial record and returns a handle to it
    pub async fn register(
        store: Arc<dyn StatsStore>,
        record: GameServerRecord,
    ) -> Result<Self, StoreError> {
        store.update(record.clone()).await?;
        info!("Registered {}", record);

        Ok(Self {
            lifecycle: Mutex::new(ServerLifecycle::new(record)),
            store,
        })
    }

    /// Runs `change` on a copy, persists it, then commits it
    async fn apply<T>(
        &self,
        change: impl FnOnce(&mut ServerLifecycle) -> T,
    ) -> Result<T, StoreError> {
        let mut current = self.lifecycle.lock().await;
        let mut next = current.clone();
        let outcome = change(&mut next);

        if next.record() != current.record() {
            self.store.update(next.record().clone()).await?;
            *current = next;
        }

        Ok(outcome)
    }

    pub async fn mark_ready(&self) -> Result<(), StoreError> {
        if self.apply(ServerLifecycle::mark_ready).await? {
            info!("Server {} is ready", self.id().await);
        }
        Ok(())
    }

    pub async fn connection_added(&self) -> Result<(), StoreError> {
        self.apply(ServerLifecycle::connection_added).await
    }

    /// Counts a connection unless the server has already closed
    pub async fn try_connection_added(&self) -> Result<bool, StoreError> {
        self.apply(|lifecycle| {
            if lifecycle.state() == GameServerState::Closed {
                return false;
            }
            lifecycle.connection_added();
            true
        })
        .await
    }

    pub async fn connection_removed(&self) -> Result<(), StoreError> {
        self.apply(ServerLifecycle::connection_removed).await
    }

    pub async fn idle_check(&self) -> Result<Option<GameServerState>, StoreError> {
        self.apply(ServerLifecycle::idle_check).await
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.apply(ServerLifecycle::close).await.map(|_| ())
    }

    pub async fn snapshot(&self) -> GameServerRecord {
        self.lifecycle.lock().await.record().clone()
    }

    pub async fn state(&self) -> GameServerState {
        self.lifecycle.lock().await.state()
    }

    async fn id(&self) -> String {
        self.lifecycle.lock().await.record().id.clone()
    }

    /// Ticks the idle check every `period` until the server closes
    ///
    /// Fires `shutdown` once Closed is reached, or returns early if it is
    /// cancelled by someone else.
    pub async fn run_idle_timer(
        &self,
        period: Duration,
        shutdown: CancelToken,
    ) -> Result<(), StoreError> {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = interval.tick() => {}
            }

            match self.idle_check().await? {
                Some(GameServerState::Closed) => {
                    info!("Server {} closing after two idle intervals", self.id().await);
                    shutdown.cancel();
                    return Ok(());
                }
                Some(state) => info!("Server {} is now {}", self.id().await, state),
                None => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::MemoryStats;
    use assert_approx_eq::assert_approx_eq;

    fn ready_lifecycle() -> ServerLifecycle {
        let mut lifecycle = ServerLifecycle::new(GameServerRecord::new("s1", "127.0.0.1", 9000));
        assert!(lifecycle.mark_ready());
        lifecycle
    }

    #[test]
    fn test_mark_ready_only_from_initializing() {
        let mut lifecycle = ready_lifecycle();
        assert!(!lifecycle.mark_ready());
        assert_eq!(lifecycle.state(), GameServerState::Ready);
    }

    #[test]
    fn test_two_idle_checks_close_server() {
        let mut lifecycle = ready_lifecycle();

        assert_eq!(lifecycle.idle_check(), Some(GameServerState::Idle));
        assert_eq!(lifecycle.idle_check(), Some(GameServerState::Closed));
        assert_eq!(lifecycle.idle_check(), None);
        assert_eq!(lifecycle.state(), GameServerState::Closed);
    }

    #[test]
    fn test_connection_during_idle_resets_to_ready() {
        let mut lifecycle = ready_lifecycle();
        assert_eq!(lifecycle.idle_check(), Some(GameServerState::Idle));

        lifecycle.connection_added();
        assert_eq!(lifecycle.state(), GameServerState::Ready);
        assert_eq!(lifecycle.idle_check(), None);

        lifecycle.connection_removed();
        assert_eq!(lifecycle.idle_check(), Some(GameServerState::Idle));
    }

    #[test]
    fn test_busy_server_never_idles() {
        let mut lifecycle = ready_lifecycle();
        lifecycle.connection_added();

        for _ in 0..5 {
            assert_eq!(lifecycle.idle_check(), None);
        }
        assert_eq!(lifecycle.state(), GameServerState::Ready);
    }

    #[test]
    fn test_connection_counters_stay_consistent() {
        let mut lifecycle = ready_lifecycle();
        lifecycle.connection_added();
        lifecycle.connection_added();
        lifecycle.connection_added();
        lifecycle.connection_removed();
        lifecycle.connection_removed();
        lifecycle.connection_removed();
        lifecycle.connection_removed();

        let record = lifecycle.record();
        assert_eq!(record.connections_added, 3);
        assert_eq!(record.connections_removed, 3);
        assert_eq!(
            record.connections,
            record.connections_added - record.connections_removed
        );
        assert_approx_eq!(record.load, 0.0, 1e-6);
    }

    #[test]
    fn test_load_tracks_connections() {
        let mut lifecycle = ready_lifecycle();
        lifecycle.connection_added();
        lifecycle.connection_added();
        assert_approx_eq!(lifecycle.record().load, 2.0 * LOAD_PER_CONNECTION, 1e-6);
    }

    #[test]
    #[should_panic(expected = "closed server")]
    fn test_accept_on_closed_server_panics() {
        let mut lifecycle = ready_lifecycle();
        lifecycle.close();
        lifecycle.connection_added();
    }

    #[tokio::test]
    async fn test_handle_persists_every_transition() {
        let store = Arc::new(MemoryStats::new());
        let handle = LifecycleHandle::register(
            store.clone(),
            GameServerRecord::new("s1", "127.0.0.1", 9000),
        )
        .await
        .unwrap();

        let stored = store.get_by_id("s1").await.unwrap();
        assert_eq!(stored.state, GameServerState::Initializing);

        handle.mark_ready().await.unwrap();
        assert_eq!(
            store.get_by_id("s1").await.unwrap().state,
            GameServerState::Ready
        );

        handle.connection_added().await.unwrap();
        let stored = store.get_by_id("s1").await.unwrap();
        assert_eq!(stored.connections, 1);
        assert_eq!(stored, handle.snapshot().await);
    }

    #[tokio::test]
    async fn test_closed_server_refuses_connections() {
        let store = Arc::new(MemoryStats::new());
        let handle = LifecycleHandle::register(
            store.clone(),
            GameServerRecord::new("s3", "127.0.0.1", 9002),
        )
        .await
        .unwrap();
        handle.mark_ready().await.unwrap();

        assert!(handle.try_connection_added().await.unwrap());
        handle.connection_removed().await.unwrap();
        handle.close().await.unwrap();

        assert!(!handle.try_connection_added().await.unwrap());
        let stored = store.get_by_id("s3").await.unwrap();
        assert_eq!(stored.state, GameServerState::Closed);
        assert_eq!(stored.connections_added, 1);
    }

    #[tokio::test]
    async fn test_idle_timer_closes_and_signals_shutdown() {
        let store = Arc::new(MemoryStats::new());
        let handle = LifecycleHandle::register(
            store.clone(),
            GameServerRecord::new("s2", "127.0.0.1", 9001),
        )
        .await
        .unwrap();
        handle.mark_ready().await.unwrap();

        let shutdown = CancelToken::new();
        tokio::time::timeout(
            Duration::from_secs(2),
            handle.run_idle_timer(Duration::from_millis(20), shutdown.clone()),
        )
        .await
        .expect("idle timer should finish")
        .unwrap();

        assert!(shutdown.is_cancelled());
        assert_eq!(
            store.get_by_id("s2").await.unwrap().state,
            GameServerState::Closed
        );
    }
}
