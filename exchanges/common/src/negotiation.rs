//! Negotiation handshake between the two peers.
//!
//! The handshake exchanges one description each way (offer from the
//! initiator, answer from the responder) plus any number of connectivity
//! candidates, all relayed through the registry. [`Negotiator`] is the state
//! machine one engine instance owns per session:
//!
//! ```text
//! idle -> negotiating -> channel-open -> closed
//!   \________\_______________\--------> failed
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    TransferError,
    transport::{PeerConnection, PeerConnector, PeerEvent, SignalingSink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// A negotiation description. The relay treats it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

/// A connectivity candidate. The relay treats it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

/// The three message kinds the engine relays through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    /// The session creator; sends the offer.
    Initiator,
    /// The joiner; answers the offer.
    Responder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Negotiating,
    ChannelOpen,
    Closed,
    Failed(String),
}

pub struct Negotiator {
    role: NegotiationRole,
    state: NegotiationState,
    connector: Arc<dyn PeerConnector>,
    signaling: Arc<dyn SignalingSink>,
    connection: Option<Arc<dyn PeerConnection>>,
    has_local_description: bool,
    pending_local_candidates: Vec<IceCandidate>,
}

impl Negotiator {
    pub fn new(
        role: NegotiationRole,
        connector: Arc<dyn PeerConnector>,
        signaling: Arc<dyn SignalingSink>,
    ) -> Self {
        Self {
            role,
            state: NegotiationState::Idle,
            connector,
            signaling,
            connection: None,
            has_local_description: false,
            pending_local_candidates: Vec::new(),
        }
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    pub fn has_local_description(&self) -> bool {
        self.has_local_description
    }

    /// Initiator side: builds the negotiation object, records a local offer
    /// and relays it.
    pub async fn start(&mut self) -> Result<mpsc::UnboundedReceiver<PeerEvent>, TransferError> {
        self.expect(NegotiationRole::Initiator, "start")?;
        self.state = NegotiationState::Negotiating;
        match self.start_inner().await {
            Ok(events) => Ok(events),
            Err(err) => Err(self.fail(err.to_string())),
        }
    }

    async fn start_inner(&mut self) -> Result<mpsc::UnboundedReceiver<PeerEvent>, TransferError> {
        let (connection, events) = self.connector.connect(self.role).await?;
        self.connection = Some(connection.clone());

        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;
        self.has_local_description = true;

        info!("Sending negotiation offer");
        self.signaling.relay(NegotiationMessage::Offer(offer)).await?;
        self.flush_local_candidates().await?;
        Ok(events)
    }

    /// Responder side: builds the negotiation object from the remote offer,
    /// records a local answer and relays it.
    pub async fn accept_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<mpsc::UnboundedReceiver<PeerEvent>, TransferError> {
        self.expect(NegotiationRole::Responder, "accept an offer")?;
        self.state = NegotiationState::Negotiating;
        match self.accept_offer_inner(offer).await {
            Ok(events) => Ok(events),
            Err(err) => Err(self.fail(err.to_string())),
        }
    }

    async fn accept_offer_inner(
        &mut self,
        offer: SessionDescription,
    ) -> Result<mpsc::UnboundedReceiver<PeerEvent>, TransferError> {
        let (connection, events) = self.connector.connect(self.role).await?;
        self.connection = Some(connection.clone());

        connection.set_remote_description(offer).await?;
        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;
        self.has_local_description = true;

        info!("Sending negotiation answer");
        self.signaling.relay(NegotiationMessage::Answer(answer)).await?;
        self.flush_local_candidates().await?;
        Ok(events)
    }

    /// Initiator side: applies the responder's answer.
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<(), TransferError> {
        if self.role != NegotiationRole::Initiator || self.state != NegotiationState::Negotiating {
            return Err(TransferError::Protocol(format!(
                "unexpected answer in state {:?} as {:?}",
                self.state, self.role
            )));
        }
        let Some(connection) = self.connection.clone() else {
            return Err(TransferError::Protocol("answer before offer".into()));
        };
        if let Err(err) = connection.set_remote_description(answer).await {
            return Err(self.fail(err.to_string()));
        }
        debug!("Applied negotiation answer");
        Ok(())
    }

    /// Applies a candidate relayed from the peer.
    ///
    /// Returns `false` when the candidate was dropped. Candidates that arrive
    /// before the local description exists are discarded rather than queued;
    /// if the relay consistently delivers them early, connectivity can fail.
    /// Queueing and replaying them after the description is recorded would
    /// close that gap.
    ///
    /// The gate checks the local description, not the remote one. A peer only
    /// relays candidates after its own offer or answer, and the relay keeps
    /// per-connection order, so on the initiator the answer (the remote
    /// description) is always applied before the first candidate reaches
    /// this point.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> bool {
        let connection = match (&self.connection, self.has_local_description) {
            (Some(connection), true) => connection.clone(),
            _ => {
                warn!("Dropping remote candidate received before local description");
                return false;
            }
        };
        match connection.add_ice_candidate(candidate).await {
            Ok(()) => {
                debug!("Remote candidate added");
                true
            }
            Err(err) => {
                warn!("Failed to add remote candidate: {}", err);
                false
            }
        }
    }

    /// Relays a locally discovered candidate as soon as the local
    /// description exists.
    pub async fn on_local_candidate(&mut self, candidate: IceCandidate) -> Result<(), TransferError> {
        if !self.has_local_description {
            self.pending_local_candidates.push(candidate);
            return Ok(());
        }
        debug!("Sending local candidate");
        self.signaling.relay(NegotiationMessage::IceCandidate(candidate)).await
    }

    async fn flush_local_candidates(&mut self) -> Result<(), TransferError> {
        for candidate in std::mem::take(&mut self.pending_local_candidates) {
            self.signaling.relay(NegotiationMessage::IceCandidate(candidate)).await?;
        }
        Ok(())
    }

    /// Records that the direct channel signalled readiness.
    pub fn on_channel_open(&mut self) {
        if self.state == NegotiationState::Negotiating {
            info!("Direct channel open");
            self.state = NegotiationState::ChannelOpen;
        }
    }

    /// Moves to `failed` (unless already closed) and returns the matching
    /// error for the caller to surface.
    pub fn fail(&mut self, reason: impl Into<String>) -> TransferError {
        let reason = reason.into();
        if self.state != NegotiationState::Closed {
            warn!("Negotiation failed: {}", reason);
            self.state = NegotiationState::Failed(reason.clone());
        }
        TransferError::NegotiationFailed(reason)
    }

    /// Releases the negotiation object.
    pub async fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        self.pending_local_candidates.clear();
        if !matches!(self.state, NegotiationState::Failed(_)) {
            self.state = NegotiationState::Closed;
        }
    }

    fn expect(&self, role: NegotiationRole, action: &str) -> Result<(), TransferError> {
        if self.role != role {
            return Err(TransferError::Protocol(format!(
                "{:?} cannot {}",
                self.role, action
            )));
        }
        if self.state != NegotiationState::Idle {
            return Err(TransferError::Protocol(format!(
                "cannot {} in state {:?}",
                action, self.state
            )));
        }
        Ok(())
    }
}
