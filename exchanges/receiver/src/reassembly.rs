use codedropx_common::{
    ChannelMessage, ControlMessage, Frame, ReceivedFile, TransferError, TransferEvent,
    progress_percent,
};
use tracing::{debug, info, warn};

/// Chunks received so far for the file currently being transferred.
struct Accumulator {
    id: String,
    name: String,
    byte_size: u64,
    mime_type: String,
    chunks: Vec<Vec<u8>>,
    received: u64,
    last_percent: Option<u8>,
}

impl Accumulator {
    fn into_file(self) -> ReceivedFile {
        ReceivedFile {
            id: self.id,
            name: self.name,
            byte_size: self.byte_size,
            mime_type: self.mime_type,
            data: self.chunks.concat(),
        }
    }
}

/// Turns the ordered frames of a direct channel back into files.
///
/// Holds at most one open file at a time; binary frames always belong to the
/// most recent `file-start`. A file is handed out only on its explicit
/// `file-complete`, and only if exactly the announced number of bytes
/// arrived.
#[derive(Default)]
pub struct Reassembler {
    current: Option<Accumulator>,
    completed_files: usize,
    finished: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `transfer-complete` has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn completed_files(&self) -> usize {
        self.completed_files
    }

    /// Drops the partially received file, if any.
    pub fn discard(&mut self) {
        if let Some(accumulator) = self.current.take() {
            debug!("Discarding partial file {}", accumulator.name);
        }
    }

    pub fn handle(&mut self, message: ChannelMessage) -> Result<Vec<TransferEvent>, TransferError> {
        let frame = match Frame::decode(message) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Ignoring unreadable control message: {}", err);
                return Ok(Vec::new());
            }
        };
        match frame {
            Frame::Chunk(bytes) => self.on_chunk(bytes),
            Frame::Control(ControlMessage::FileStart {
                id,
                name,
                byte_size,
                mime_type,
                ..
            }) => {
                if let Some(previous) = self.current.take() {
                    warn!("File {} was never completed, dropping it", previous.name);
                }
                debug!("Receiving file {} ({} bytes)", name, byte_size);
                self.current = Some(Accumulator {
                    id,
                    name,
                    byte_size,
                    mime_type,
                    chunks: Vec::new(),
                    received: 0,
                    last_percent: None,
                });
                Ok(Vec::new())
            }
            Frame::Control(ControlMessage::FileComplete { id, .. }) => self.on_file_complete(id),
            Frame::Control(ControlMessage::TransferComplete) => {
                info!("Transfer complete, {} files received", self.completed_files);
                self.discard();
                self.finished = true;
                Ok(vec![TransferEvent::TransferComplete])
            }
        }
    }

    fn on_chunk(&mut self, bytes: Vec<u8>) -> Result<Vec<TransferEvent>, TransferError> {
        let Some(current) = self.current.as_mut() else {
            warn!("Dropping {} bytes received outside of a file", bytes.len());
            return Ok(Vec::new());
        };
        let received = current.received + bytes.len() as u64;
        if received > current.byte_size {
            return Err(TransferError::Protocol(format!(
                "{} exceeds its declared size of {} bytes",
                current.name, current.byte_size
            )));
        }
        current.received = received;
        current.chunks.push(bytes);

        let percent = progress_percent(current.received, current.byte_size);
        current.last_percent = Some(percent);
        Ok(vec![TransferEvent::Progress {
            id: current.id.clone(),
            name: current.name.clone(),
            percent,
        }])
    }

    fn on_file_complete(&mut self, id: String) -> Result<Vec<TransferEvent>, TransferError> {
        let Some(current) = self.current.take() else {
            return Err(TransferError::Protocol(format!(
                "file-complete for {id} without a matching file-start"
            )));
        };
        if current.id != id {
            return Err(TransferError::Protocol(format!(
                "file-complete for {id} while receiving {}",
                current.id
            )));
        }
        if current.received != current.byte_size {
            return Err(TransferError::Protocol(format!(
                "{} ended at {} of {} bytes",
                current.name, current.received, current.byte_size
            )));
        }

        let mut events = Vec::with_capacity(2);
        if current.last_percent != Some(100) {
            events.push(TransferEvent::Progress {
                id: current.id.clone(),
                name: current.name.clone(),
                percent: 100,
            });
        }
        debug!("File {} received completely", current.name);
        self.completed_files += 1;
        events.push(TransferEvent::FileReceived(current.into_file()));
        Ok(events)
    }
}
