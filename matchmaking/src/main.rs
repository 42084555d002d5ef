use clap::Parser;
use log::{error, info};
use matchmaking::cancel::CancelToken;
use matchmaking::coordinator::{Coordinator, CoordinatorConfig};
use matchmaking::fleet::{FleetManager, LocalFleet, LocalFleetConfig, DEFAULT_STATS_PATH};
use matchmaking::network::MatchmakingServer;
use matchmaking::proxy::{ConnectionProxy, ProxyConfig, TcpConnectionFactory};
use matchmaking::stats::open_store;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to accept clients on
    #[arg(short = 'H', long, env = "MM_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(short, long, env = "MM_PORT", default_value = "42000")]
    port: u16,

    /// Stats file shared with the game servers
    #[arg(long, env = "STATS_JSON", default_value = DEFAULT_STATS_PATH)]
    stats_json: PathBuf,

    /// How long a client has to send its auth packet
    #[arg(long, env = "AUTH_TIMEOUT_MS", default_value = "5000")]
    auth_timeout_ms: u64,

    /// Servers at or above this load are not matched
    #[arg(long, env = "MAX_LOAD", default_value = "0.9")]
    max_load: f32,

    #[arg(long, env = "READY_TIMEOUT_MS", default_value = "30000")]
    ready_timeout_ms: u64,

    /// Interval of the dead game-server sweep
    #[arg(long, env = "SWEEP_INTERVAL_MS", default_value = "3000")]
    sweep_interval_ms: u64,

    /// Game-server executable to spawn
    #[arg(long, env = "GAME_SERVER", default_value = "dummy_server")]
    game_server: PathBuf,

    /// Reject clients whose first packet is not an auth packet
    #[arg(long, env = "STRICT_AUTH")]
    strict_auth: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    info!("Starting matchmaking with {:?}", args);

    // Stale servers from a previous run must never be selected
    let stats = open_store(Some(args.stats_json.as_path()), true).await?;

    let fleet = Arc::new(LocalFleet::new(
        LocalFleetConfig {
            program: args.game_server.clone(),
            stats_path: Some(args.stats_json.clone()),
            ready_timeout: Duration::from_millis(args.ready_timeout_ms),
            ..LocalFleetConfig::default()
        },
        stats.clone(),
    ));

    let coordinator = Arc::new(Coordinator::new(
        stats.clone(),
        fleet.clone(),
        CoordinatorConfig {
            max_load: args.max_load,
        },
    ));

    let shutdown = CancelToken::new();
    let proxy = Arc::new(ConnectionProxy::new(
        coordinator.clone(),
        Arc::new(TcpConnectionFactory),
        ProxyConfig {
            auth_timeout: Duration::from_millis(args.auth_timeout_ms),
            strict_auth: args.strict_auth,
        },
        shutdown.child_token(),
    ));

    let address = format!("{}:{}", args.host, args.port);
    let server = MatchmakingServer::bind(&address, proxy).await?;

    let stats_handle = {
        let stats = stats.clone();
        let cancel = shutdown.clone();
        tokio::spawn(async move { stats.run(cancel).await })
    };

    let sweeper_handle = {
        let coordinator = coordinator.clone();
        let cancel = shutdown.clone();
        let interval = Duration::from_millis(args.sweep_interval_ms);
        tokio::spawn(async move { coordinator.run_sweeper(interval, cancel).await })
    };

    let server_handle = tokio::spawn(server.run(shutdown.clone()));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
    for (name, handle) in [
        ("stats", stats_handle),
        ("sweeper", sweeper_handle),
        ("server", server_handle),
    ] {
        if let Err(e) = handle.await {
            error!("{} task panicked: {}", name, e);
        }
    }

    fleet.shutdown().await;
    info!("Matchmaking stopped");

    Ok(())
}
