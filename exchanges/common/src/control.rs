//! Framing on the direct channel.
//!
//! Control messages travel as JSON text frames; file bytes travel as raw
//! binary frames that belong to the most recently announced file.

use serde::{Deserialize, Serialize};

use crate::{TransferError, transport::ChannelMessage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Announces the next file. Every binary frame that follows belongs to
    /// it until the matching `file-complete`.
    FileStart {
        id: String,
        name: String,
        #[serde(rename = "size")]
        byte_size: u64,
        mime_type: String,
        index: usize,
    },
    FileComplete {
        id: String,
        index: usize,
    },
    TransferComplete,
}

impl ControlMessage {
    pub fn encode(&self) -> Result<ChannelMessage, TransferError> {
        Ok(ChannelMessage::Text(serde_json::to_string(self)?))
    }
}

/// A decoded direct-channel frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Control(ControlMessage),
    Chunk(Vec<u8>),
}

impl Frame {
    pub fn decode(message: ChannelMessage) -> Result<Self, TransferError> {
        match message {
            ChannelMessage::Text(text) => Ok(Frame::Control(serde_json::from_str(&text)?)),
            ChannelMessage::Binary(bytes) => Ok(Frame::Chunk(bytes)),
        }
    }
}
