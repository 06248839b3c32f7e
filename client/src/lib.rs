//! # Session Client Library
//!
//! Headless client for the session server. It speaks the same protocol as the
//! server and is what the bot binary and the end-to-end tests drive.
//!
//! ## Connection Flow
//!
//! 1. [`Connection::connect`] opens the stream, generates a throwaway RSA key
//!    and runs the key exchange: greet under the default key, receive the
//!    server's public key, send the sealed key-exchange blob and decrypt the
//!    session key the server picked.
//! 2. [`Connection::login`] sends one login or registration request, hashing
//!    the password first, and turns the result code into a [`Client`] or a
//!    [`ClientError::Rejected`].
//! 3. The [`Client`] sends positions as datagrams, receives position snapshots
//!    the same way and answers the server's pings in the background.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{ClientConfig, Connection};
//! use shared::Position;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("127.0.0.1:1942".parse()?);
//!     let connection = Connection::connect(config).await?;
//!     let client = connection.login("alice", "secret", true).await?;
//!
//!     client.send_position(Position::new(1.0, 0.0, 0.0)).await?;
//!     let snapshot = client.recv_snapshot(Duration::from_secs(1)).await?;
//!     println!("tick {}: {:?}", snapshot.tick, snapshot.positions);
//!
//!     client.logout().await?;
//!     Ok(())
//! }
//! ```

pub mod network;

pub use network::{hash_password, Client, ClientConfig, ClientError, Connection};
