//! In-process transport.
//!
//! [`LoopbackNetwork`] pairs one initiator with one responder inside the same
//! process: the "descriptions" are placeholders, every recorded local
//! description yields one synthetic candidate, and once both sides hold a
//! local and a remote description a [`LoopbackChannel`] pair is opened.
//! The channel accounts its backlog like a real data channel: bytes count as
//! buffered from `send` until the peer takes them with `recv`.

use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::debug;

use crate::{
    TransferError,
    negotiation::{IceCandidate, NegotiationRole, SdpType, SessionDescription},
    transport::{ChannelMessage, DirectChannel, PeerConnection, PeerConnector, PeerEvent},
};

pub struct LoopbackChannel {
    tx: Mutex<Option<mpsc::UnboundedSender<ChannelMessage>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<ChannelMessage>>,
    outgoing: Arc<AtomicU64>,
    incoming: Arc<AtomicU64>,
    peak: AtomicU64,
    open: Arc<AtomicBool>,
}

/// Two connected ends of an in-process channel.
pub fn channel_pair() -> (LoopbackChannel, LoopbackChannel) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    let a_backlog = Arc::new(AtomicU64::new(0));
    let b_backlog = Arc::new(AtomicU64::new(0));
    let open = Arc::new(AtomicBool::new(true));

    let a = LoopbackChannel {
        tx: Mutex::new(Some(a_tx)),
        rx: AsyncMutex::new(a_rx),
        outgoing: a_backlog.clone(),
        incoming: b_backlog.clone(),
        peak: AtomicU64::new(0),
        open: open.clone(),
    };
    let b = LoopbackChannel {
        tx: Mutex::new(Some(b_tx)),
        rx: AsyncMutex::new(b_rx),
        outgoing: b_backlog,
        incoming: a_backlog,
        peak: AtomicU64::new(0),
        open,
    };
    (a, b)
}

impl LoopbackChannel {
    /// Largest backlog observed right after a `send`.
    pub fn peak_buffered_amount(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<ChannelMessage>>> {
        self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DirectChannel for LoopbackChannel {
    async fn send(&self, message: ChannelMessage) -> Result<(), TransferError> {
        if !self.is_open() {
            return Err(TransferError::ChannelClosed);
        }
        let len = message.len() as u64;
        let guard = self.sender();
        let Some(tx) = guard.as_ref() else {
            return Err(TransferError::ChannelClosed);
        };
        let backlog = self.outgoing.fetch_add(len, Ordering::AcqRel) + len;
        if tx.send(message).is_err() {
            self.outgoing.fetch_sub(len, Ordering::AcqRel);
            return Err(TransferError::ChannelClosed);
        }
        self.peak.fetch_max(backlog, Ordering::Relaxed);
        Ok(())
    }

    async fn recv(&self) -> Option<ChannelMessage> {
        let message = self.rx.lock().await.recv().await?;
        self.incoming.fetch_sub(message.len() as u64, Ordering::AcqRel);
        Some(message)
    }

    fn buffered_amount(&self) -> u64 {
        self.outgoing.load(Ordering::Acquire)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.sender().take();
        self.rx.lock().await.close();
    }
}

#[derive(Default)]
struct Endpoint {
    events: Option<mpsc::UnboundedSender<PeerEvent>>,
    has_local: bool,
    has_remote: bool,
}

impl Endpoint {
    fn ready(&self) -> bool {
        self.events.is_some() && self.has_local && self.has_remote
    }
}

#[derive(Default)]
struct NetworkState {
    initiator: Endpoint,
    responder: Endpoint,
    opened: bool,
}

impl NetworkState {
    fn endpoint(&mut self, role: NegotiationRole) -> &mut Endpoint {
        match role {
            NegotiationRole::Initiator => &mut self.initiator,
            NegotiationRole::Responder => &mut self.responder,
        }
    }
}

/// In-process [`PeerConnector`] hosting one initiator/responder pair.
///
/// Clones share the same network, so the sender and the receiver of a test
/// can each hold one.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
    candidates_added: Arc<AtomicUsize>,
    fail_with: Option<String>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A network whose connections report a transport failure as soon as
    /// they record a local description.
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            fail_with: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Number of remote candidates applied across both sides.
    pub fn candidates_added(&self) -> usize {
        self.candidates_added.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PeerConnector for LoopbackNetwork {
    async fn connect(
        &self,
        role: NegotiationRole,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>), TransferError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.lock();
            *state.endpoint(role) = Endpoint {
                events: Some(tx),
                ..Endpoint::default()
            };
            state.opened = false;
        }
        debug!("Loopback connection created as {:?}", role);
        let connection = LoopbackConnection {
            role,
            network: self.clone(),
        };
        Ok((Arc::new(connection), rx))
    }
}

struct LoopbackConnection {
    role: NegotiationRole,
    network: LoopbackNetwork,
}

impl LoopbackConnection {
    fn description(kind: SdpType) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: format!("v=0\r\ns=loopback-{kind:?}\r\n").to_lowercase(),
        }
    }

    fn open_if_ready(state: &mut NetworkState) {
        if state.opened || !state.initiator.ready() || !state.responder.ready() {
            return;
        }
        state.opened = true;
        let (a, b) = channel_pair();
        if let Some(events) = &state.initiator.events {
            let _ = events.send(PeerEvent::ChannelOpen(Arc::new(a)));
        }
        if let Some(events) = &state.responder.events {
            let _ = events.send(PeerEvent::ChannelOpen(Arc::new(b)));
        }
        debug!("Loopback channel opened");
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    async fn create_offer(&self) -> Result<SessionDescription, TransferError> {
        Ok(Self::description(SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransferError> {
        let mut state = self.network.lock();
        if !state.endpoint(self.role).has_remote {
            return Err(TransferError::NegotiationFailed(
                "cannot answer without a remote offer".into(),
            ));
        }
        Ok(Self::description(SdpType::Answer))
    }

    async fn set_local_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), TransferError> {
        let mut state = self.network.lock();
        let fail_with = self.network.fail_with.clone();
        let endpoint = state.endpoint(self.role);
        endpoint.has_local = true;
        if let Some(events) = &endpoint.events {
            let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 0 typ host ({:?})", self.role),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            }));
            if let Some(reason) = fail_with {
                let _ = events.send(PeerEvent::Failed(reason));
                return Ok(());
            }
        }
        Self::open_if_ready(&mut state);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        _description: SessionDescription,
    ) -> Result<(), TransferError> {
        let mut state = self.network.lock();
        state.endpoint(self.role).has_remote = true;
        if self.network.fail_with.is_none() {
            Self::open_if_ready(&mut state);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransferError> {
        self.network.candidates_added.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.network.lock();
        if let Some(events) = state.endpoint(self.role).events.take() {
            let _ = events.send(PeerEvent::Closed);
        }
    }
}
