//! TCP accept loop in front of the connection proxy

use crate::cancel::CancelToken;
use crate::proxy::ConnectionProxy;
use log::{debug, error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// Listens on the well-known matchmaking address and hands every client to the proxy
pub struct MatchmakingServer {
    listener: TcpListener,
    proxy: Arc<ConnectionProxy>,
    next_connection_id: u64,
}

impl MatchmakingServer {
    pub async fn bind(
        addr: &str,
        proxy: Arc<ConnectionProxy>,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(addr).await?;
        info!("Matchmaking listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            proxy,
            next_connection_id: 0,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts clients until `cancel` fires, then closes the proxy
    pub async fn run(mut self, cancel: CancelToken) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.spawn_connection(stream, peer),
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }

        info!(
            "Matchmaking stopped accepting, {} connections still open",
            self.proxy.active_connections()
        );
        self.proxy.close();
    }

    fn spawn_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_connection_id;
        self.next_connection_id += 1;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Connection {}: could not set nodelay: {}", id, e);
        }
        info!("Connection {} accepted from {}", id, peer);

        let proxy = self.proxy.clone();
        tokio::spawn(async move {
            let _ = proxy.handle(id, Box::new(stream)).await;
        });
    }
}
