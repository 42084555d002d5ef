//! Minimal game server used for local fleets and load tests
//!
//! Registers itself in the stats store, echoes every Message packet back to
//! its sender and exits once its lifecycle reaches Closed.

use clap::Parser;
use log::{debug, error, info, warn};
use matchmaking::cancel::CancelToken;
use matchmaking::lifecycle::LifecycleHandle;
use matchmaking::stats::{open_store, GameServerRecord};
use protocol::{frame_with_reader, write_packet, PacketType};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Id assigned by the fleet
    #[arg(long, env = "ID")]
    id: String,

    /// Address published to the matchmaker
    #[arg(short = 'H', long, env = "GS_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on, 0 picks a free one
    #[arg(short, long, env = "GS_PORT", default_value = "0")]
    port: u16,

    #[arg(long, env = "STATS_JSON")]
    stats_json: Option<PathBuf>,

    #[arg(long, env = "IDLE_INTERVAL_MS", default_value = "30000")]
    idle_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let stats = open_store(args.stats_json.as_deref(), false).await?;

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    let port = listener.local_addr()?.port();
    info!("Game server {} listening on {}:{}", args.id, args.host, port);

    let lifecycle = Arc::new(
        LifecycleHandle::register(stats, GameServerRecord::new(&args.id, &args.host, port)).await?,
    );
    lifecycle.mark_ready().await?;

    let shutdown = CancelToken::new();

    let idle_handle = {
        let lifecycle = lifecycle.clone();
        let shutdown = shutdown.clone();
        let period = Duration::from_millis(args.idle_interval_ms);
        tokio::spawn(async move {
            if let Err(e) = lifecycle.run_idle_timer(period, shutdown.clone()).await {
                error!("Idle timer failed: {}", e);
                shutdown.cancel();
            }
        })
    };

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };

        // The idle timer may have closed the server between accept and here
        if !lifecycle.try_connection_added().await? {
            debug!("Dropping connection from {} on closed server", peer);
            break;
        }
        info!("Connection from {} ({})", peer, lifecycle.snapshot().await);

        let lifecycle = lifecycle.clone();
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            serve(stream, cancel).await;
            if let Err(e) = lifecycle.connection_removed().await {
                error!("Failed to record disconnect: {}", e);
            }
        });
    }

    shutdown.cancel();
    lifecycle.close().await?;
    if let Err(e) = idle_handle.await {
        error!("Idle timer panicked: {}", e);
    }
    info!("Game server {} finished", args.id);

    Ok(())
}

/// Echoes Message packets until the peer closes or disconnects
async fn serve(stream: TcpStream, cancel: CancelToken) {
    let (reader, mut writer) = stream.into_split();
    let mut packets = frame_with_reader(reader);

    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => break,
            next = packets.recv() => match next {
                Some(Ok(packet)) => packet,
                Some(Err(e)) => {
                    warn!("Dropping connection: {}", e);
                    break;
                }
                None => break,
            },
        };

        match packet.packet_type() {
            PacketType::CloseConnection => break,
            PacketType::Message => {
                if let Err(e) = write_packet(&mut writer, &packet).await {
                    debug!("Echo failed: {}", e);
                    break;
                }
            }
            other => debug!("Ignoring {} packet", other),
        }
    }

    let _ = writer.shutdown().await;
}
