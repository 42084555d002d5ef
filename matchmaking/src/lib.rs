//! # Matchmaking Relay
//!
//! Clients connect to one well-known address. The relay authenticates each
//! connection, finds or provisions a game server for it, and then forwards
//! packets between the two until either side closes.
//!
//! ## Connection Flow
//!
//! 1. [`network::MatchmakingServer`] accepts the TCP connection and assigns it
//!    an id
//! 2. [`proxy::ConnectionProxy`] waits for the client's auth packet
//! 3. [`coordinator::Coordinator`] picks the least loaded Ready server, or has
//!    the fleet create one (only one creation runs at a time; everyone else
//!    waits for it)
//! 4. The proxy dials the server, confirms it to the client and relays framed
//!    packets in both directions
//!
//! ## Game Servers
//!
//! Game servers publish their own state to a [`stats::StatsStore`] following
//! the [`lifecycle`] state machine (Initializing → Ready ⇄ Idle → Closed).
//! The coordinator only ever reads that store; [`fleet::LocalFleet`] starts
//! servers as child processes sharing a JSON stats file.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use matchmaking::cancel::CancelToken;
//! use matchmaking::coordinator::{Coordinator, CoordinatorConfig};
//! use matchmaking::fleet::{LocalFleet, LocalFleetConfig, DEFAULT_STATS_PATH};
//! use matchmaking::network::MatchmakingServer;
//! use matchmaking::proxy::{ConnectionProxy, ProxyConfig, TcpConnectionFactory};
//! use matchmaking::stats::open_store;
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stats = open_store(Some(Path::new(DEFAULT_STATS_PATH)), true).await?;
//!     let fleet = Arc::new(LocalFleet::new(LocalFleetConfig::default(), stats.clone()));
//!     let coordinator = Arc::new(Coordinator::new(stats, fleet, CoordinatorConfig::default()));
//!
//!     let shutdown = CancelToken::new();
//!     let proxy = Arc::new(ConnectionProxy::new(
//!         coordinator,
//!         Arc::new(TcpConnectionFactory),
//!         ProxyConfig::default(),
//!         shutdown.child_token(),
//!     ));
//!
//!     MatchmakingServer::bind("0.0.0.0:42000", proxy)
//!         .await?
//!         .run(shutdown)
//!         .await;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod coordinator;
pub mod fleet;
pub mod lifecycle;
pub mod network;
pub mod proxy;
pub mod stats;
