mod send_files;

use codedrop_entities::Data;
use std::{sync::Arc, time::Duration};

pub use send_files::*;

pub struct SenderFile {
    pub name: String,
    /// Empty means unknown; sent as `application/octet-stream`.
    pub mime_type: String,
    pub data: Arc<dyn Data>,
}

#[derive(Clone, Debug)]
pub struct SenderConfig {
    pub chunk_size: u64,
    /// The pump stops queueing chunks while the channel backlog is above
    /// this many bytes.
    pub high_water_mark: u64,
    pub backlog_poll_interval: Duration,
    /// How long to wait for the relay to confirm the session.
    pub relay_timeout: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16 * 1024,
            high_water_mark: 16 * 1024 * 1024,
            backlog_poll_interval: Duration::from_millis(10),
            relay_timeout: Duration::from_secs(10),
        }
    }
}
