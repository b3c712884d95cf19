//! Relay wire protocol.
//!
//! Every message is one JSON object carrying its kind in a `type` field and
//! its payload fields in camelCase, e.g.
//! `{"type":"join-session","sessionCode":"ABCD1234"}`.

use codedrop_entities::SessionCode;
use serde::{Deserialize, Serialize};

use crate::negotiation::{IceCandidate, SessionDescription};

/// Messages a participant sends to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    CreateSession {
        session_code: SessionCode,
    },
    JoinSession {
        session_code: SessionCode,
    },
    AcceptConnection {
        session_code: SessionCode,
        receiver_id: String,
    },
    RejectConnection {
        session_code: SessionCode,
        receiver_id: String,
    },
    WebrtcOffer {
        session_code: SessionCode,
        offer: SessionDescription,
    },
    WebrtcAnswer {
        session_code: SessionCode,
        answer: SessionDescription,
    },
    WebrtcIceCandidate {
        session_code: SessionCode,
        candidate: IceCandidate,
    },
    TransferComplete {
        session_code: SessionCode,
    },
}

impl ClientMessage {
    pub fn session_code(&self) -> &SessionCode {
        match self {
            ClientMessage::CreateSession { session_code }
            | ClientMessage::JoinSession { session_code }
            | ClientMessage::AcceptConnection { session_code, .. }
            | ClientMessage::RejectConnection { session_code, .. }
            | ClientMessage::WebrtcOffer { session_code, .. }
            | ClientMessage::WebrtcAnswer { session_code, .. }
            | ClientMessage::WebrtcIceCandidate { session_code, .. }
            | ClientMessage::TransferComplete { session_code } => session_code,
        }
    }
}

/// Messages the registry sends to a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    SessionCreated {
        session_code: SessionCode,
    },
    SessionError {
        message: String,
    },
    ConnectionRequest {
        receiver_id: String,
        session_code: SessionCode,
    },
    WaitingForApproval {
        session_code: SessionCode,
    },
    ConnectionAccepted {
        session_code: SessionCode,
    },
    ConnectionRejected {
        session_code: SessionCode,
    },
    WebrtcOffer {
        offer: SessionDescription,
    },
    WebrtcAnswer {
        answer: SessionDescription,
    },
    WebrtcIceCandidate {
        candidate: IceCandidate,
    },
    TransferComplete {
        session_code: SessionCode,
    },
    PeerDisconnected {
        session_code: SessionCode,
    },
}
