//! Matchmaking coordinator
//!
//! Picks the least loaded Ready server from the stats store, and provisions a
//! new one through the fleet when none qualifies. Provisioning is single-flight:
//! while one request is creating a server, every other request that also found
//! nothing waits for that same server instead of starting its own.

use crate::cancel::CancelToken;
use crate::fleet::{FleetError, FleetManager};
use crate::stats::{StatsStore, StoreError};
use log::{debug, error, info, warn};
use protocol::ClientId;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Servers at or above this load are never selected
pub const DEFAULT_MAX_LOAD: f32 = 0.9;

/// Reference interval between dead-instance sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("no server below the load limit is ready")]
    NoBestServer,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fleet(#[from] FleetError),

    /// Shared by every request that waited on the same provisioning attempt
    #[error("provisioning a game server failed: {0}")]
    Provisioning(Arc<FleetError>),

    #[error("provisioning was abandoned before it finished")]
    ProvisioningAbandoned,

    #[error("matchmaking cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_load: f32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_load: DEFAULT_MAX_LOAD,
        }
    }
}

/// Where a client was sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub server_id: String,
    /// `host:port`
    pub addr: String,
}

type Outcome = Result<String, Arc<FleetError>>;

#[derive(Default)]
struct SingleFlight {
    /// Set while a provisioning attempt is outstanding
    waiting: Option<watch::Receiver<Option<Outcome>>>,
    last_created: Option<String>,
}

enum Role {
    Leader(watch::Sender<Option<Outcome>>),
    Follower(watch::Receiver<Option<Outcome>>),
}

/// Clears the in-flight marker even if the leader is dropped mid-provision
struct FlightGuard<'a> {
    coordinator: &'a Coordinator,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.lock_flight().waiting = None;
    }
}

pub struct Coordinator {
    stats: Arc<dyn StatsStore>,
    fleet: Arc<dyn FleetManager>,
    config: CoordinatorConfig,
    flight: Mutex<SingleFlight>,
}

impl Coordinator {
    pub fn new(
        stats: Arc<dyn StatsStore>,
        fleet: Arc<dyn FleetManager>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            stats,
            fleet,
            config,
            flight: Mutex::new(SingleFlight::default()),
        }
    }

    fn lock_flight(&self) -> MutexGuard<'_, SingleFlight> {
        match self.flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Id of the most recently provisioned server, if any
    pub fn last_created_id(&self) -> Option<String> {
        self.lock_flight().last_created.clone()
    }

    pub fn is_provisioning(&self) -> bool {
        self.lock_flight().waiting.is_some()
    }

    /// Least loaded Ready server below `max_load`
    pub async fn get_best_server(&self) -> Result<String, CoordinatorError> {
        let servers = self
            .stats
            .get_servers_by_utilization(self.config.max_load)
            .await?;

        servers
            .into_iter()
            .next()
            .map(|record| record.id)
            .ok_or(CoordinatorError::NoBestServer)
    }

    /// Finds or provisions a server for one client
    pub async fn matchmake(
        &self,
        client_id: Option<&ClientId>,
        cancel: &CancelToken,
    ) -> Result<Match, CoordinatorError> {
        let client = client_id.map(ToString::to_string).unwrap_or_else(|| "-".to_string());

        let server_id = match self.get_best_server().await {
            Ok(id) => id,
            Err(CoordinatorError::NoBestServer) => {
                debug!("No server available for client {}, provisioning", client);
                self.create_and_wait(cancel).await?
            }
            Err(e) => {
                error!("Best-server lookup failed for client {}: {}", client, e);
                return Err(e);
            }
        };

        let addr = self.fleet.get_connection_string(&server_id).await?;
        info!("Client {} matched to server {} at {}", client, server_id, addr);

        Ok(Match { server_id, addr })
    }

    /// Provisions one server, or joins the attempt already in flight
    pub async fn create_and_wait(&self, cancel: &CancelToken) -> Result<String, CoordinatorError> {
        let role = {
            let mut flight = self.lock_flight();
            match &flight.waiting {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    flight.waiting = Some(rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => self.lead(tx, cancel).await,
            Role::Follower(rx) => Self::follow(rx, cancel).await,
        }
    }

    async fn lead(
        &self,
        tx: watch::Sender<Option<Outcome>>,
        cancel: &CancelToken,
    ) -> Result<String, CoordinatorError> {
        let guard = FlightGuard { coordinator: self };

        info!("Creating a new game server");
        let outcome = self.provision(cancel).await.map_err(Arc::new);

        match &outcome {
            Ok(id) => {
                info!("Game server {} is ready", id);
                self.lock_flight().last_created = Some(id.clone());
            }
            Err(e) => warn!("Game server provisioning failed: {}", e),
        }

        // Clear before broadcasting so a failed attempt can be retried at once
        drop(guard);
        tx.send_replace(Some(outcome.clone()));

        outcome.map_err(CoordinatorError::Provisioning)
    }

    async fn provision(&self, cancel: &CancelToken) -> Result<String, FleetError> {
        let id = self.fleet.create_new_server(cancel).await?;
        debug!("Waiting for game server {}", id);
        self.fleet.wait_for_ready(cancel, &id).await?;
        Ok(id)
    }

    async fn follow(
        mut rx: watch::Receiver<Option<Outcome>>,
        cancel: &CancelToken,
    ) -> Result<String, CoordinatorError> {
        debug!("Already provisioning, waiting for that server");

        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome.map_err(CoordinatorError::Provisioning);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(CoordinatorError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(CoordinatorError::ProvisioningAbandoned);
                    }
                }
            }
        }
    }

    /// Asks the fleet to reap dead instances every `interval` until cancelled
    pub async fn run_sweeper(&self, interval: Duration, cancel: CancelToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Dead-instance sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.fleet.reap_dead_instances().await {
                Ok(reaped) if !reaped.is_empty() => {
                    info!("Reaped {} dead game servers: {:?}", reaped.len(), reaped)
                }
                Ok(_) => {}
                Err(e) => error!("Dead-instance sweep failed: {}", e),
            }
        }
    }
}
