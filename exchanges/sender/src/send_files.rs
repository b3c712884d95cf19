mod handler;
mod pump;

use crate::{SenderConfig, SenderFile};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use codedrop_entities::{File, SessionCode};
use codedropx_common::{
    ClientMessage, ConnectionStatus, NegotiationRole, Negotiator, PeerConnector,
    RelayConnection, RelayLink, RelaySignaling, ServerMessage, Subscribers, TransferSubscriber,
};
use handler::{Carrier, Command};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

pub struct SendFilesRequest {
    pub files: Vec<SenderFile>,
    pub config: SenderConfig,
    /// Relay connection dedicated to this session. It is closed when the
    /// session ends.
    pub relay: RelayConnection,
    pub connector: Arc<dyn PeerConnector>,
}

/// Handle on a sending session.
///
/// Dropping the bubble cancels the session.
pub struct SendFilesBubble {
    code: SessionCode,
    link: Arc<dyn RelayLink>,
    subscribers: Subscribers,
    commands: mpsc::UnboundedSender<Command>,
    cancel: watch::Sender<bool>,
    is_finished: Arc<AtomicBool>,
    created_at: DateTime<Utc>,
}
impl SendFilesBubble {
    /// The code the receiver has to enter.
    pub fn get_code(&self) -> String {
        self.code.to_string()
    }

    /// Approves the pending join request of `receiver_id`.
    pub async fn accept(&self, receiver_id: &str) -> Result<()> {
        info!(session = %self.code, peer = %receiver_id, "Accepting receiver");
        self.link
            .send(ClientMessage::AcceptConnection {
                session_code: self.code.clone(),
                receiver_id: receiver_id.to_string(),
            })
            .await
            .context("failed to accept connection")
    }

    /// Turns `receiver_id` away; the session becomes joinable again.
    pub async fn reject(&self, receiver_id: &str) -> Result<()> {
        self.commands
            .send(Command::Reject(receiver_id.to_string()))
            .map_err(|_| anyhow::anyhow!("session {} has already finished", self.code))
    }

    pub fn cancel(&self) {
        info!(session = %self.code, "Cancelling file transfer");
        let _ = self.cancel.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.is_finished.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        !self.is_finished() && self.get_status() == ConnectionStatus::Connected
    }

    pub fn get_status(&self) -> ConnectionStatus {
        self.subscribers
            .current_status()
            .unwrap_or(ConnectionStatus::WaitingForPeer)
    }

    pub fn get_created_at(&self) -> String {
        self.created_at.to_rfc3339()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn TransferSubscriber>) {
        self.subscribers.subscribe(subscriber);
    }

    pub fn unsubscribe(&self, subscriber: Arc<dyn TransferSubscriber>) {
        self.subscribers.unsubscribe(subscriber);
    }
}

/// Registers a new session with the relay and waits for a receiver in the
/// background.
pub async fn send_files(request: SendFilesRequest) -> Result<SendFilesBubble> {
    if request.files.is_empty() {
        bail!("no files to send");
    }
    info!("Starting file transfer with {} files", request.files.len());
    debug!(
        "Sender config: chunk_size={}, high_water_mark={}",
        request.config.chunk_size, request.config.high_water_mark
    );

    let RelayConnection { link, mut inbound } = request.relay;
    let code = SessionCode::generate();
    link.send(ClientMessage::CreateSession {
        session_code: code.clone(),
    })
    .await
    .context("failed to register session")?;

    tokio::time::timeout(
        request.config.relay_timeout,
        wait_for_creation(&code, &mut inbound),
    )
    .await
    .context("relay did not confirm the session")??;
    info!(session = %code, "Session created");

    let files: Vec<File> = request
        .files
        .into_iter()
        .enumerate()
        .map(|(index, f)| File::positional(index, f.name, f.mime_type, f.data))
        .collect();

    let subscribers = Subscribers::new();
    subscribers.status(ConnectionStatus::WaitingForPeer);
    let is_finished = Arc::new(AtomicBool::new(false));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let signaling = Arc::new(RelaySignaling::new(link.clone(), code.clone()));

    let carrier = Carrier {
        code: code.clone(),
        files,
        config: request.config,
        link: link.clone(),
        inbound,
        relay_open: true,
        commands: commands_rx,
        negotiator: Negotiator::new(NegotiationRole::Initiator, request.connector, signaling),
        subscribers: subscribers.clone(),
        is_finished: is_finished.clone(),
        cancel: cancel_rx,
        peer_events: None,
        channel: None,
        pump: None,
        batch_sent: false,
    };
    tokio::spawn(carrier.run());

    Ok(SendFilesBubble {
        code,
        link,
        subscribers,
        commands: commands_tx,
        cancel: cancel_tx,
        is_finished,
        created_at: Utc::now(),
    })
}

async fn wait_for_creation(
    code: &SessionCode,
    inbound: &mut mpsc::UnboundedReceiver<ServerMessage>,
) -> Result<()> {
    while let Some(message) = inbound.recv().await {
        match message {
            ServerMessage::SessionCreated { session_code } if &session_code == code => {
                return Ok(());
            }
            ServerMessage::SessionError { message } => bail!("relay refused the session: {message}"),
            other => debug!("Ignoring relay message {:?} while creating session", other),
        }
    }
    bail!("relay connection closed before the session was created")
}
