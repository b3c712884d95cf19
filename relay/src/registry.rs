//! Pairing sessions and the rules for moving through them.
//!
//! ```text
//! create -> waiting --join--> pending --accept--> connected
//!              ^                 |
//!              +-----reject------+
//! ```
//!
//! A session is destroyed on transfer completion, when either participant
//! disconnects, or once it is older than the TTL, whichever comes first.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use codedrop_entities::{SessionCode, SessionStatus};
use codedropx_common::{ClientMessage, NegotiationMessage, ServerMessage};
use thiserror::Error;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Opaque identifier of one relay connection.
pub type PeerId = String;

/// Refusals reported back to the caller as `session-error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Session code already exists")]
    CodeExists,
    #[error("Session not found")]
    NotFound,
    #[error("Session already has a receiver")]
    AlreadyHasReceiver,
    #[error("Invalid session or permission")]
    Unauthorized,
    #[error("No pending receiver with that id")]
    NoPendingReceiver,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub code: SessionCode,
    pub sender: PeerId,
    pub receiver: Option<PeerId>,
    pub status: SessionStatus,
    pub created_at: Instant,
}

impl Session {
    fn other(&self, caller: &str) -> Option<&PeerId> {
        if self.sender == caller {
            self.receiver.as_ref()
        } else {
            Some(&self.sender)
        }
    }

    fn involves(&self, peer: &str) -> bool {
        self.sender == peer || self.receiver.as_deref() == Some(peer)
    }
}

/// Outbound queues of every connected participant.
#[derive(Clone, Default)]
pub struct PeerDirectory {
    inner: Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<ServerMessage>>>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an id for a new connection and returns the queue of
    /// messages addressed to it.
    pub fn register(&self) -> (PeerId, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(id.clone(), tx);
        (id, rx)
    }

    pub fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Queues `message` for `id`. Returns `false` if the peer is gone.
    pub fn send(&self, id: &str, message: ServerMessage) -> bool {
        match self.lock().get(id) {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerId, mpsc::UnboundedSender<ServerMessage>>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Store of live sessions.
///
/// Every operation runs under one lock and never awaits, so operations on
/// the same code are applied one after another and messages reach each peer
/// in the order the operations happened.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<SessionCode, Session>>>,
    peers: PeerDirectory,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(peers: PeerDirectory, ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            peers,
            ttl,
        }
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the session registered under `code`.
    pub fn session(&self, code: &SessionCode) -> Option<Session> {
        self.lock().get(code).cloned()
    }

    pub fn create_session(&self, code: SessionCode, caller: &str) -> Result<(), RegistryError> {
        let mut sessions = self.lock();
        if sessions.contains_key(&code) {
            return Err(RegistryError::CodeExists);
        }
        sessions.insert(
            code.clone(),
            Session {
                code: code.clone(),
                sender: caller.to_string(),
                receiver: None,
                status: SessionStatus::Waiting,
                created_at: Instant::now(),
            },
        );
        info!(session = %code, peer = %caller, "Session created");
        self.peers
            .send(caller, ServerMessage::SessionCreated { session_code: code });
        Ok(())
    }

    pub fn join_session(&self, code: &SessionCode, caller: &str) -> Result<(), RegistryError> {
        let mut sessions = self.lock();
        let session = sessions.get_mut(code).ok_or(RegistryError::NotFound)?;
        if session.receiver.is_some() {
            return Err(RegistryError::AlreadyHasReceiver);
        }
        session.receiver = Some(caller.to_string());
        session.status = SessionStatus::Pending;

        info!(session = %code, peer = %caller, "Receiver joined");
        self.peers.send(
            &session.sender,
            ServerMessage::ConnectionRequest {
                receiver_id: caller.to_string(),
                session_code: code.clone(),
            },
        );
        self.peers.send(
            caller,
            ServerMessage::WaitingForApproval {
                session_code: code.clone(),
            },
        );
        Ok(())
    }

    /// Approves the pending receiver. Only the session's sender may do this;
    /// `receiver_id`, when given, must name the pending receiver.
    pub fn accept_connection(
        &self,
        code: &SessionCode,
        caller: &str,
        receiver_id: Option<&str>,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(code)
            .filter(|session| session.sender == caller)
            .ok_or(RegistryError::Unauthorized)?;
        let receiver = pending_receiver(session, receiver_id)?;
        session.status = SessionStatus::Connected;

        info!(session = %code, peer = %receiver, "Connection accepted");
        for peer in [session.sender.as_str(), receiver.as_str()] {
            self.peers.send(
                peer,
                ServerMessage::ConnectionAccepted {
                    session_code: code.clone(),
                },
            );
        }
        Ok(())
    }

    /// Turns the pending receiver away; the session goes back to waiting
    /// and can be joined again.
    pub fn reject_connection(
        &self,
        code: &SessionCode,
        caller: &str,
        receiver_id: Option<&str>,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(code)
            .filter(|session| session.sender == caller)
            .ok_or(RegistryError::Unauthorized)?;
        let receiver = pending_receiver(session, receiver_id)?;
        session.receiver = None;
        session.status = SessionStatus::Waiting;

        info!(session = %code, peer = %receiver, "Connection rejected");
        self.peers.send(
            &receiver,
            ServerMessage::ConnectionRejected {
                session_code: code.clone(),
            },
        );
        Ok(())
    }

    /// Forwards a negotiation payload to the other participant. Offers only
    /// travel sender to receiver and answers only receiver to sender;
    /// anything else is dropped silently.
    pub fn relay_negotiation(&self, code: &SessionCode, caller: &str, payload: NegotiationMessage) {
        let sessions = self.lock();
        let Some(session) = sessions.get(code) else {
            debug!(session = %code, "Dropping negotiation for unknown session");
            return;
        };
        let (target, message) = match payload {
            NegotiationMessage::Offer(offer) if session.sender == caller => {
                (session.receiver.as_ref(), ServerMessage::WebrtcOffer { offer })
            }
            NegotiationMessage::Answer(answer)
                if session.receiver.as_deref() == Some(caller) =>
            {
                (Some(&session.sender), ServerMessage::WebrtcAnswer { answer })
            }
            NegotiationMessage::IceCandidate(candidate) if session.involves(caller) => {
                (session.other(caller), ServerMessage::WebrtcIceCandidate { candidate })
            }
            _ => {
                debug!(session = %code, peer = %caller, "Dropping misdirected negotiation message");
                return;
            }
        };
        match target {
            Some(target) => {
                self.peers.send(target, message);
            }
            None => debug!(session = %code, "No counterpart to relay to"),
        }
    }

    /// Tells every member the batch is done and destroys the session.
    pub fn notify_transfer_complete(&self, code: &SessionCode) {
        let mut sessions = self.lock();
        let Some(session) = sessions.remove(code) else {
            return;
        };
        for peer in std::iter::once(&session.sender).chain(session.receiver.as_ref()) {
            self.peers.send(
                peer,
                ServerMessage::TransferComplete {
                    session_code: code.clone(),
                },
            );
        }
        info!(session = %code, "Transfer completed, session cleaned up");
    }

    /// Destroys every session `caller` takes part in, telling the other
    /// participant. Returns how many sessions were destroyed.
    pub fn disconnect(&self, caller: &str) -> usize {
        let mut sessions = self.lock();
        let codes: Vec<SessionCode> = sessions
            .values()
            .filter(|session| session.involves(caller))
            .map(|session| session.code.clone())
            .collect();
        for code in &codes {
            let Some(session) = sessions.remove(code) else {
                continue;
            };
            if let Some(other) = session.other(caller) {
                self.peers.send(
                    other,
                    ServerMessage::PeerDisconnected {
                        session_code: code.clone(),
                    },
                );
            }
            info!(session = %code, peer = %caller, "Session cleaned up due to disconnect");
        }
        codes.len()
    }

    /// Destroys sessions older than the TTL. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|code, session| {
            let alive = now.saturating_duration_since(session.created_at) <= self.ttl;
            if !alive {
                info!(session = %code, "Session expired and removed");
            }
            alive
        });
        before - sessions.len()
    }

    /// Applies one inbound relay message from `caller`. Refusals are reported
    /// to the caller as `session-error`.
    pub fn handle(&self, caller: &str, message: ClientMessage) {
        let result = match message {
            ClientMessage::CreateSession { session_code } => {
                self.create_session(session_code, caller)
            }
            ClientMessage::JoinSession { session_code } => {
                self.join_session(&session_code, caller)
            }
            ClientMessage::AcceptConnection {
                session_code,
                receiver_id,
            } => self.accept_connection(&session_code, caller, Some(&receiver_id)),
            ClientMessage::RejectConnection {
                session_code,
                receiver_id,
            } => self.reject_connection(&session_code, caller, Some(&receiver_id)),
            ClientMessage::WebrtcOffer {
                session_code,
                offer,
            } => {
                self.relay_negotiation(&session_code, caller, NegotiationMessage::Offer(offer));
                Ok(())
            }
            ClientMessage::WebrtcAnswer {
                session_code,
                answer,
            } => {
                self.relay_negotiation(&session_code, caller, NegotiationMessage::Answer(answer));
                Ok(())
            }
            ClientMessage::WebrtcIceCandidate {
                session_code,
                candidate,
            } => {
                self.relay_negotiation(
                    &session_code,
                    caller,
                    NegotiationMessage::IceCandidate(candidate),
                );
                Ok(())
            }
            ClientMessage::TransferComplete { session_code } => {
                self.notify_transfer_complete(&session_code);
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(peer = %caller, "Refused: {}", err);
            self.peers.send(
                caller,
                ServerMessage::SessionError {
                    message: err.to_string(),
                },
            );
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionCode, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The receiver waiting for approval. Once a session is connected there is
/// nobody pending, so repeated accepts and late rejects are refused.
fn pending_receiver(session: &Session, receiver_id: Option<&str>) -> Result<PeerId, RegistryError> {
    if session.status != SessionStatus::Pending {
        return Err(RegistryError::NoPendingReceiver);
    }
    match (&session.receiver, receiver_id) {
        (Some(receiver), None) => Ok(receiver.clone()),
        (Some(receiver), Some(id)) if receiver == id => Ok(receiver.clone()),
        _ => Err(RegistryError::NoPendingReceiver),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codedropx_common::{IceCandidate, SdpType, SessionDescription};
    use rstest::rstest;

    const TTL: Duration = Duration::from_secs(300);

    struct Peer {
        id: PeerId,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    impl Peer {
        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut messages = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                messages.push(message);
            }
            messages
        }
    }

    fn setup() -> (SessionRegistry, Peer, Peer) {
        let peers = PeerDirectory::new();
        let registry = SessionRegistry::new(peers.clone(), TTL);
        let (id, rx) = peers.register();
        let sender = Peer { id, rx };
        let (id, rx) = peers.register();
        let receiver = Peer { id, rx };
        (registry, sender, receiver)
    }

    fn code() -> SessionCode {
        "ABCD1234".parse().unwrap()
    }

    fn offer() -> SessionDescription {
        SessionDescription {
            kind: SdpType::Offer,
            sdp: "v=0".into(),
        }
    }

    #[tokio::test]
    async fn duplicate_code_leaves_the_original_untouched() {
        let (registry, mut sender, receiver) = setup();
        registry.create_session(code(), &sender.id).unwrap();
        let before = registry.session(&code()).unwrap();

        assert_eq!(
            registry.create_session(code(), &receiver.id),
            Err(RegistryError::CodeExists)
        );
        assert_eq!(registry.session(&code()).unwrap(), before);
        assert_eq!(
            sender.drain(),
            vec![ServerMessage::SessionCreated { session_code: code() }]
        );
    }

    #[tokio::test]
    async fn join_notifies_both_sides() {
        let (registry, mut sender, mut receiver) = setup();
        registry.create_session(code(), &sender.id).unwrap();
        sender.drain();

        registry.join_session(&code(), &receiver.id).unwrap();
        let session = registry.session(&code()).unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.receiver.as_deref(), Some(receiver.id.as_str()));

        assert_eq!(
            sender.drain(),
            vec![ServerMessage::ConnectionRequest {
                receiver_id: receiver.id.clone(),
                session_code: code()
            }]
        );
        assert_eq!(
            receiver.drain(),
            vec![ServerMessage::WaitingForApproval { session_code: code() }]
        );
    }

    #[tokio::test]
    async fn second_receiver_is_refused() {
        let (registry, sender, receiver) = setup();
        let (intruder, _rx) = registry.peers().register();
        registry.create_session(code(), &sender.id).unwrap();
        registry.join_session(&code(), &receiver.id).unwrap();
        let before = registry.session(&code()).unwrap();

        assert_eq!(
            registry.join_session(&code(), &intruder),
            Err(RegistryError::AlreadyHasReceiver)
        );
        assert_eq!(registry.session(&code()).unwrap(), before);
    }

    #[tokio::test]
    async fn unknown_code_is_not_found() {
        let (registry, _sender, receiver) = setup();
        assert_eq!(
            registry.join_session(&code(), &receiver.id),
            Err(RegistryError::NotFound)
        );
    }

    #[tokio::test]
    async fn accept_connects_and_tells_both() {
        let (registry, mut sender, mut receiver) = setup();
        registry.create_session(code(), &sender.id).unwrap();
        registry.join_session(&code(), &receiver.id).unwrap();
        sender.drain();
        receiver.drain();

        assert_eq!(
            registry.accept_connection(&code(), &receiver.id, None),
            Err(RegistryError::Unauthorized)
        );
        registry
            .accept_connection(&code(), &sender.id, Some(&receiver.id))
            .unwrap();

        assert_eq!(
            registry.session(&code()).unwrap().status,
            SessionStatus::Connected
        );
        let accepted = ServerMessage::ConnectionAccepted { session_code: code() };
        assert_eq!(sender.drain(), vec![accepted.clone()]);
        assert_eq!(receiver.drain(), vec![accepted]);
    }

    #[tokio::test]
    async fn accept_needs_the_pending_receiver() {
        let (registry, sender, receiver) = setup();
        registry.create_session(code(), &sender.id).unwrap();
        assert_eq!(
            registry.accept_connection(&code(), &sender.id, None),
            Err(RegistryError::NoPendingReceiver)
        );

        registry.join_session(&code(), &receiver.id).unwrap();
        assert_eq!(
            registry.accept_connection(&code(), &sender.id, Some("someone-else")),
            Err(RegistryError::NoPendingReceiver)
        );
        assert_eq!(
            registry.session(&code()).unwrap().status,
            SessionStatus::Pending
        );
    }

    #[rstest]
    #[case::repeated_accept(true)]
    #[case::late_reject(false)]
    #[tokio::test]
    async fn connected_session_has_nobody_pending(#[case] accept: bool) {
        let (registry, mut sender, mut receiver) = setup();
        registry.create_session(code(), &sender.id).unwrap();
        registry.join_session(&code(), &receiver.id).unwrap();
        registry
            .accept_connection(&code(), &sender.id, Some(&receiver.id))
            .unwrap();
        sender.drain();
        receiver.drain();

        let again = if accept {
            registry.accept_connection(&code(), &sender.id, Some(&receiver.id))
        } else {
            registry.reject_connection(&code(), &sender.id, Some(&receiver.id))
        };
        assert_eq!(again, Err(RegistryError::NoPendingReceiver));

        let session = registry.session(&code()).unwrap();
        assert_eq!(session.status, SessionStatus::Connected);
        assert_eq!(session.receiver.as_ref(), Some(&receiver.id));
        assert!(sender.drain().is_empty());
        assert!(receiver.drain().is_empty());
    }

    #[tokio::test]
    async fn reject_reopens_the_session() {
        let (registry, sender, mut receiver) = setup();
        registry.create_session(code(), &sender.id).unwrap();
        registry.join_session(&code(), &receiver.id).unwrap();
        receiver.drain();

        registry
            .reject_connection(&code(), &sender.id, Some(&receiver.id))
            .unwrap();
        let session = registry.session(&code()).unwrap();
        assert_eq!(session.status, SessionStatus::Waiting);
        assert_eq!(session.receiver, None);
        assert_eq!(
            receiver.drain(),
            vec![ServerMessage::ConnectionRejected { session_code: code() }]
        );

        registry.join_session(&code(), &receiver.id).unwrap();
        assert_eq!(
            registry.session(&code()).unwrap().status,
            SessionStatus::Pending
        );
    }

    #[tokio::test]
    async fn reject_by_stranger_is_unauthorized() {
        let (registry, sender, receiver) = setup();
        registry.create_session(code(), &sender.id).unwrap();
        registry.join_session(&code(), &receiver.id).unwrap();
        assert_eq!(
            registry.reject_connection(&code(), &receiver.id, Some(&receiver.id)),
            Err(RegistryError::Unauthorized)
        );
        assert_eq!(
            registry.reject_connection(&"ZZZZ9999".parse().unwrap(), &sender.id, None),
            Err(RegistryError::Unauthorized)
        );
    }

    #[tokio::test]
    async fn negotiation_flows_in_the_allowed_directions() {
        let (registry, mut sender, mut receiver) = setup();
        registry.create_session(code(), &sender.id).unwrap();
        registry.join_session(&code(), &receiver.id).unwrap();
        sender.drain();
        receiver.drain();

        // A receiver cannot send an offer, and nothing reaches anyone.
        registry.relay_negotiation(&code(), &receiver.id, NegotiationMessage::Offer(offer()));
        assert!(sender.drain().is_empty());

        registry.relay_negotiation(&code(), &sender.id, NegotiationMessage::Offer(offer()));
        assert_eq!(
            receiver.drain(),
            vec![ServerMessage::WebrtcOffer { offer: offer() }]
        );

        let candidate = IceCandidate {
            candidate: "candidate:1".into(),
            sdp_mid: None,
            sdp_m_line_index: None,
        };
        registry.relay_negotiation(
            &code(),
            &receiver.id,
            NegotiationMessage::IceCandidate(candidate.clone()),
        );
        assert_eq!(
            sender.drain(),
            vec![ServerMessage::WebrtcIceCandidate { candidate }]
        );

        registry.relay_negotiation(
            &"ZZZZ9999".parse().unwrap(),
            &sender.id,
            NegotiationMessage::Offer(offer()),
        );
        assert!(receiver.drain().is_empty());
    }

    #[tokio::test]
    async fn candidate_without_counterpart_is_dropped() {
        let (registry, mut sender, _receiver) = setup();
        registry.create_session(code(), &sender.id).unwrap();
        sender.drain();
        registry.relay_negotiation(
            &code(),
            &sender.id,
            NegotiationMessage::IceCandidate(IceCandidate {
                candidate: "candidate:1".into(),
                sdp_mid: None,
                sdp_m_line_index: None,
            }),
        );
        assert!(sender.drain().is_empty());
    }

    #[tokio::test]
    async fn transfer_complete_broadcasts_and_destroys() {
        let (registry, mut sender, mut receiver) = setup();
        registry.create_session(code(), &sender.id).unwrap();
        registry.join_session(&code(), &receiver.id).unwrap();
        sender.drain();
        receiver.drain();

        registry.notify_transfer_complete(&code());
        let done = ServerMessage::TransferComplete { session_code: code() };
        assert_eq!(sender.drain(), vec![done.clone()]);
        assert_eq!(receiver.drain(), vec![done]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn disconnect_notifies_the_survivor_exactly_once() {
        let (registry, mut sender, mut receiver) = setup();
        registry.create_session(code(), &sender.id).unwrap();
        registry.join_session(&code(), &receiver.id).unwrap();
        registry
            .accept_connection(&code(), &sender.id, None)
            .unwrap();
        sender.drain();
        receiver.drain();

        assert_eq!(registry.disconnect(&sender.id), 1);
        assert_eq!(registry.disconnect(&sender.id), 0);
        assert_eq!(
            receiver.drain(),
            vec![ServerMessage::PeerDisconnected { session_code: code() }]
        );
        assert_eq!(
            registry.join_session(&code(), &receiver.id),
            Err(RegistryError::NotFound)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_expire_after_the_ttl() {
        let (registry, sender, receiver) = setup();
        registry.create_session(code(), &sender.id).unwrap();
        let other: SessionCode = "WXYZ0000".parse().unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        registry.create_session(other.clone(), &receiver.id).unwrap();

        tokio::time::advance(Duration::from_secs(179)).await;
        assert_eq!(registry.sweep_expired(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(registry.sweep_expired(), 1);
        assert!(registry.session(&code()).is_none());
        assert!(registry.session(&other).is_some());
    }

    #[tokio::test]
    async fn refusals_come_back_as_session_errors() {
        let (registry, mut sender, _receiver) = setup();
        registry.handle(
            &sender.id,
            ClientMessage::JoinSession {
                session_code: code(),
            },
        );
        assert_eq!(
            sender.drain(),
            vec![ServerMessage::SessionError {
                message: "Session not found".into()
            }]
        );

        registry.handle(
            &sender.id,
            ClientMessage::AcceptConnection {
                session_code: code(),
                receiver_id: "nobody".into(),
            },
        );
        assert_eq!(
            sender.drain(),
            vec![ServerMessage::SessionError {
                message: "Invalid session or permission".into()
            }]
        );
    }
}
