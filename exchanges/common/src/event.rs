use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{Arc, RwLock},
};

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::TransferError;

/// Where a session currently stands, as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ConnectionStatus {
    WaitingForPeer,
    ConnectionRequested { receiver_id: String },
    WaitingForApproval,
    Connecting,
    Connected,
    Rejected,
    PeerDisconnected,
    SessionError { message: String },
    Failed { reason: String },
    Completed,
    Cancelled,
}

impl ConnectionStatus {
    /// Whether the session can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Rejected
                | ConnectionStatus::PeerDisconnected
                | ConnectionStatus::SessionError { .. }
                | ConnectionStatus::Failed { .. }
                | ConnectionStatus::Completed
                | ConnectionStatus::Cancelled
        )
    }
}

impl From<TransferError> for ConnectionStatus {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Cancelled => ConnectionStatus::Cancelled,
            TransferError::PeerDisconnected => ConnectionStatus::PeerDisconnected,
            TransferError::SessionRejected => ConnectionStatus::Rejected,
            TransferError::SessionError(message) => ConnectionStatus::SessionError { message },
            other => ConnectionStatus::Failed {
                reason: other.to_string(),
            },
        }
    }
}

/// A fully reassembled file. Ownership of `data` moves to the subscriber.
#[derive(Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub id: String,
    pub name: String,
    pub byte_size: u64,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl Debug for ReceivedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedFile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("byte_size", &self.byte_size)
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    StatusChanged(ConnectionStatus),
    Progress { id: String, name: String, percent: u8 },
    FileReceived(ReceivedFile),
    ChannelReady,
    /// The whole batch has been sent or received.
    TransferComplete,
}

/// `round(done / total * 100)`, clamped to 100. An empty file is complete
/// from the start.
pub fn progress_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let percent = (done as f64 / total as f64 * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}

pub trait TransferSubscriber: Send + Sync {
    fn get_id(&self) -> String;
    fn notify(&self, event: TransferEvent);
}

/// Registered observers of one session, keyed by subscriber id.
///
/// Also remembers the last status announced, so an observer that subscribes
/// late can still ask where the session stands.
#[derive(Clone, Default)]
pub struct Subscribers {
    inner: Arc<RwLock<HashMap<String, Arc<dyn TransferSubscriber>>>>,
    last_status: Arc<RwLock<Option<ConnectionStatus>>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn TransferSubscriber>) {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(subscriber.get_id(), subscriber);
    }

    pub fn unsubscribe(&self, subscriber: Arc<dyn TransferSubscriber>) {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&subscriber.get_id());
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify(&self, event: TransferEvent) {
        let subscribers: Vec<_> = self
            .inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        for subscriber in subscribers {
            subscriber.notify(event.clone());
        }
    }

    pub fn status(&self, status: ConnectionStatus) {
        *self
            .last_status
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(status.clone());
        self.notify(TransferEvent::StatusChanged(status));
    }

    pub fn current_status(&self) -> Option<ConnectionStatus> {
        self.last_status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Subscriber that forwards every event into an unbounded channel.
pub struct ChannelSubscriber {
    id: String,
    tx: mpsc::UnboundedSender<TransferEvent>,
}

impl ChannelSubscriber {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: Uuid::new_v4().to_string(),
                tx,
            },
            rx,
        )
    }
}

impl TransferSubscriber for ChannelSubscriber {
    fn get_id(&self) -> String {
        self.id.clone()
    }

    fn notify(&self, event: TransferEvent) {
        let _ = self.tx.send(event);
    }
}
