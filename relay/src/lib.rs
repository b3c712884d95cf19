//! codedrop relay
//!
//! The always-on half of codedrop. It pairs a sender and a receiver by a
//! short session code and forwards their negotiation messages until they can
//! talk directly; file bytes never pass through it.
//!
//! This library provides:
//! - `SessionRegistry`: the pairing state machine and TTL bookkeeping.
//! - `PeerDirectory`: outbound queues of connected clients.
//! - `server`: the axum application with the `/ws` relay endpoint and the
//!   `/health` liveness endpoint.
//! - `RelayConfig`: settings loaded from TOML and the command line.
//!
//! Run a relay on an ephemeral port
//! ```no_run
//! use codedrop_relay::{RelayConfig, server};
//! # async fn demo() -> anyhow::Result<()> {
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
//! server::serve(listener, RelayConfig::default(), std::future::pending()).await?;
//! # Ok(())
//! # }
//! ```

mod cli;
mod config;
mod registry;
pub mod server;
mod sweeper;

pub use cli::{Args, run_cli};
pub use config::{ConfigError, RelayConfig};
pub use registry::{PeerDirectory, PeerId, RegistryError, Session, SessionRegistry};
pub use sweeper::spawn_sweeper;
