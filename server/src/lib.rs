//! # Session Server Library
//!
//! Accepts untrusted clients, negotiates an encrypted channel with each of
//! them, authenticates players against a credential store and keeps every
//! admitted player's position replicated to everyone else.
//!
//! ## Connection Lifecycle
//!
//! 1. **Handshake** (`handshake`): the client greets under the well-known
//!    default key, the server answers with its RSA public key and the two sides
//!    bootstrap a fresh per-connection session key.
//! 2. **Authentication** (`auth`): the server reserves a slot, reads one login
//!    or registration request and answers with a result code. Rejected
//!    connections are closed after a short delay.
//! 3. **Session**: the committed session gets an ingress loop reading its
//!    stream and a writer draining its outbound queue (`ingress`). Datagrams
//!    are matched to sessions by endpoint.
//! 4. **Disconnect**: logout, stream failure, missed pings or shutdown remove
//!    the session from its slot (`registry`). Removal is idempotent.
//!
//! ## Background Tasks
//!
//! The server runs a handful of long-lived tasks next to the per-connection
//! ones, each restarted by a supervisor if it panics:
//! - **Accept loop**: one task per incoming stream connection
//! - **Datagram loop**: position updates and ping answers sent over UDP
//! - **Replication** (`replication`): fixed-rate position snapshots
//! - **Maintenance**: pings, timeouts and traffic counters (`stats`)
//! - **Dispatch**: logout and other queued control packets
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::credentials::MemoryStore;
//! use server::{Server, ServerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         port: 1942,
//!         max_players: 32,
//!         ..Default::default()
//!     };
//!
//!     let server = Server::bind(config, Arc::new(MemoryStore::new())).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod credentials;
pub mod handshake;
pub mod ingress;
pub mod network;
pub mod registry;
pub mod replication;
pub mod stats;
pub mod supervisor;

pub use config::{load_or_create_key, ConfigError, ServerConfig};
pub use credentials::{CredentialStore, JsonFileStore, MemoryStore, StoreError};
pub use network::{Server, ServerError};
pub use registry::{Registry, Session};
