//! Seams to the environment-supplied transport capability.
//!
//! The engine never talks to a concrete network stack. It needs three
//! things from its environment:
//! - a [`RelayLink`] to push relay-protocol messages to the registry,
//! - a [`PeerConnector`] that builds the local negotiation object
//!   ([`PeerConnection`]) and reports its progress as [`PeerEvent`]s,
//! - the [`DirectChannel`] handed over once negotiation succeeds.
//!
//! [`crate::loopback`] implements the peer side in-process and
//! [`crate::signaling::RelayClient`] implements the relay side over a
//! websocket.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use codedrop_entities::SessionCode;
use tokio::sync::mpsc;

use crate::{
    TransferError,
    negotiation::{IceCandidate, NegotiationMessage, NegotiationRole, SessionDescription},
    relay::{ClientMessage, ServerMessage},
};

/// One message on the direct channel.
///
/// Control messages travel as text, file chunks as binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl ChannelMessage {
    /// Size of the payload in bytes, as counted by the channel backlog.
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(text) => text.len(),
            ChannelMessage::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered, message-oriented point-to-point channel between the two peers.
#[async_trait]
pub trait DirectChannel: Send + Sync {
    /// Queues a message. Returns once the message is accepted into the
    /// channel's outgoing buffer, not when it is delivered.
    async fn send(&self, message: ChannelMessage) -> Result<(), TransferError>;

    /// Next inbound message, or `None` once the channel is closed and
    /// drained.
    async fn recv(&self) -> Option<ChannelMessage>;

    /// Bytes queued locally that the transport has not yet put on the wire.
    fn buffered_amount(&self) -> u64;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// Progress reported by a [`PeerConnection`] while negotiating.
pub enum PeerEvent {
    /// A local connectivity candidate was discovered.
    LocalCandidate(IceCandidate),
    /// The direct channel is ready for use.
    ChannelOpen(Arc<dyn DirectChannel>),
    /// Negotiation failed or timed out inside the transport.
    Failed(String),
    /// The connection was closed by the transport.
    Closed,
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            PeerEvent::ChannelOpen(_) => f.write_str("ChannelOpen"),
            PeerEvent::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
            PeerEvent::Closed => f.write_str("Closed"),
        }
    }
}

/// The local negotiation object.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransferError>;

    /// Builds an answer for the remote offer previously applied with
    /// [`PeerConnection::set_remote_description`].
    async fn create_answer(&self) -> Result<SessionDescription, TransferError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransferError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransferError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransferError>;

    async fn close(&self);
}

/// Factory for negotiation objects.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Creates a fresh negotiation object for `role` together with the
    /// stream of events it will report.
    async fn connect(
        &self,
        role: NegotiationRole,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), TransferError>;
}

/// Outbound half of the relay connection.
#[async_trait]
pub trait RelayLink: Send + Sync {
    async fn send(&self, message: ClientMessage) -> Result<(), TransferError>;

    /// Leaves the relay. The registry treats this as a disconnect and tears
    /// down every session this participant belongs to.
    async fn close(&self);
}

/// A relay connection: the outbound link plus the stream of messages the
/// registry addressed to this participant.
pub struct RelayConnection {
    pub link: Arc<dyn RelayLink>,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Where the [`crate::negotiation::Negotiator`] sends the messages it
/// produces.
#[async_trait]
pub trait SignalingSink: Send + Sync {
    async fn relay(&self, message: NegotiationMessage) -> Result<(), TransferError>;
}

/// [`SignalingSink`] that wraps negotiation messages into relay messages for
/// one session.
pub struct RelaySignaling {
    link: Arc<dyn RelayLink>,
    code: SessionCode,
}

impl RelaySignaling {
    pub fn new(link: Arc<dyn RelayLink>, code: SessionCode) -> Self {
        Self { link, code }
    }
}

#[async_trait]
impl SignalingSink for RelaySignaling {
    async fn relay(&self, message: NegotiationMessage) -> Result<(), TransferError> {
        let session_code = self.code.clone();
        let message = match message {
            NegotiationMessage::Offer(offer) => ClientMessage::WebrtcOffer {
                session_code,
                offer,
            },
            NegotiationMessage::Answer(answer) => ClientMessage::WebrtcAnswer {
                session_code,
                answer,
            },
            NegotiationMessage::IceCandidate(candidate) => ClientMessage::WebrtcIceCandidate {
                session_code,
                candidate,
            },
        };
        self.link.send(message).await
    }
}
