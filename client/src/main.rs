use clap::Parser;
use client::{ClientError, DummyClient};
use log::{error, info, warn};
use std::time::{Duration, Instant};
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Matchmaking address to connect to
    #[arg(short = 'm', long, default_value = "127.0.0.1:42000")]
    matchmaking: String,

    /// Number of concurrent clients
    #[arg(short = 'c', long, default_value = "1")]
    clients: usize,

    /// Messages each client sends before disconnecting
    #[arg(short = 'n', long, default_value = "5")]
    messages: usize,

    /// Pause between messages in milliseconds
    #[arg(short = 'i', long, default_value = "100")]
    interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    info!(
        "Starting {} clients against {} ({} messages each)",
        args.clients, args.matchmaking, args.messages
    );

    let started = Instant::now();
    let mut handles = Vec::with_capacity(args.clients);
    for _ in 0..args.clients {
        let address = args.matchmaking.clone();
        let messages = args.messages;
        let interval = Duration::from_millis(args.interval_ms);
        handles.push(tokio::spawn(async move {
            run_client(&address, messages, interval).await
        }));
    }

    let mut failed = 0;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Client failed: {}", e);
                failed += 1;
            }
            Err(e) => {
                error!("Client task panicked: {}", e);
                failed += 1;
            }
        }
    }

    info!(
        "{} of {} clients finished cleanly in {:.2?}",
        args.clients - failed,
        args.clients,
        started.elapsed()
    );

    Ok(())
}

async fn run_client(address: &str, messages: usize, interval: Duration) -> Result<(), ClientError> {
    let mut client = DummyClient::new(address);
    client.connect().await?;

    for n in 0..messages {
        client.send_message(&format!("message {} from {}", n, client.id())).await?;

        match client.recv().await? {
            Some(packet) if packet.is_close() => {
                warn!("Client {}: server closed after {} messages", client.id(), n);
                return Ok(());
            }
            Some(_) => {}
            None => return Err(ClientError::ConnectionClosed),
        }

        sleep(interval).await;
    }

    client.disconnect().await
}
