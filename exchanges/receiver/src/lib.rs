//! Receive-side library for codedrop transfers.
//!
//! This crate joins a session by its code and reassembles the files the
//! sender pushes over the direct channel. It exposes:
//! - `Reassembler`: the pure frame-to-event state machine of the receive
//!   pipeline, usable on its own.
//! - `receive_files`: the session driver, returning a `ReceiveFilesBubble`
//!   to observe and control the session.
//!
//! Typical flow:
//! 1. Build a `ReceiveFilesRequest` with the code the sender shows, a relay
//!    connection and a peer connector.
//! 2. Call `receive_files` and wait until the relay confirms the join
//!    (`waiting-for-approval`).
//! 3. Subscribe to events. Once the sender approves, negotiation runs on its
//!    own and every completed file arrives as `TransferEvent::FileReceived`.
//! 4. Optionally cancel with `ReceiveFilesBubble::cancel()`.

mod reassembly;
mod receive_files;

use std::time::Duration;

pub use reassembly::Reassembler;
pub use receive_files::*;

/// Settings for the receiving side.
#[derive(Clone, Debug)]
pub struct ReceiverConfig {
    /// How long to wait for the relay to acknowledge the join.
    pub relay_timeout: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            relay_timeout: Duration::from_secs(10),
        }
    }
}
