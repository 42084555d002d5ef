//! # Dummy Client Library
//!
//! Scripted client for exercising the matchmaking relay end to end. A
//! [`DummyClient`] connects to the matchmaking address, authenticates with its
//! 16-byte id, learns which game server it was sent to, and then exchanges
//! packets with that server through the relay.
//!
//! ## Client States
//!
//! `Initialized → Connecting → Connected → Disconnected`
//!
//! A client becomes Disconnected when it disconnects itself, when the game
//! server sends CloseConnection, or when the relay goes away.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::DummyClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = DummyClient::new("127.0.0.1:42000");
//!     let response = client.connect().await?;
//!     println!("matched to {}", response.server_id);
//!
//!     client.send_message("hello").await?;
//!     if let Some(reply) = client.recv().await? {
//!         println!("echoed {} bytes", reply.len());
//!     }
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod network;

pub use network::{ClientError, ClientState, DummyClient};
