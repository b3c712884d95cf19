mod handler;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use codedrop_entities::SessionCode;
use codedropx_common::{
    ClientMessage, ConnectionStatus, NegotiationRole, Negotiator, PeerConnector,
    RelayConnection, RelaySignaling, ServerMessage, Subscribers, TransferSubscriber,
};
use handler::Carrier;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::ReceiverConfig;

pub struct ReceiveFilesRequest {
    /// The code shown by the sender. Case and surrounding whitespace are
    /// ignored.
    pub code: String,
    pub config: ReceiverConfig,
    /// Relay connection dedicated to this session. It is closed when the
    /// session ends.
    pub relay: RelayConnection,
    pub connector: Arc<dyn PeerConnector>,
}

/// Handle on a receiving session.
///
/// Completed files are delivered to subscribers as
/// `TransferEvent::FileReceived`; files handed out stay valid whatever
/// happens to the session afterwards. Dropping the bubble cancels the
/// session.
pub struct ReceiveFilesBubble {
    code: SessionCode,
    subscribers: Subscribers,
    cancel: watch::Sender<bool>,
    is_finished: Arc<AtomicBool>,
    created_at: DateTime<Utc>,
}
impl ReceiveFilesBubble {
    pub fn get_code(&self) -> String {
        self.code.to_string()
    }

    /// Abandons the session. Partially received files are discarded and the
    /// sender is told the peer went away.
    pub fn cancel(&self) {
        info!(session = %self.code, "Cancelling file reception");
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
            .unwrap_or(ConnectionStatus::WaitingForApproval)
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

/// Joins the session named by `request.code` and waits for the sender's
/// approval in the background.
///
/// Fails if the code is malformed or the relay refuses the join (unknown
/// code, or the session already has a receiver).
pub async fn receive_files(request: ReceiveFilesRequest) -> Result<ReceiveFilesBubble> {
    let code = SessionCode::parse(&request.code).context("invalid session code")?;
    info!(session = %code, "Joining session");

    let RelayConnection { link, mut inbound } = request.relay;
    link.send(ClientMessage::JoinSession {
        session_code: code.clone(),
    })
    .await
    .context("failed to join session")?;

    tokio::time::timeout(
        request.config.relay_timeout,
        wait_for_join(&code, &mut inbound),
    )
    .await
    .context("relay did not acknowledge the join")??;

    let subscribers = Subscribers::new();
    subscribers.status(ConnectionStatus::WaitingForApproval);
    let is_finished = Arc::new(AtomicBool::new(false));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let signaling = Arc::new(RelaySignaling::new(link.clone(), code.clone()));

    let carrier = Carrier {
        code: code.clone(),
        link,
        inbound,
        negotiator: Negotiator::new(NegotiationRole::Responder, request.connector, signaling),
        subscribers: subscribers.clone(),
        is_finished: is_finished.clone(),
        cancel: cancel_rx,
        peer_events: None,
        channel: None,
        reader: None,
    };
    tokio::spawn(carrier.run());

    Ok(ReceiveFilesBubble {
        code,
        subscribers,
        cancel: cancel_tx,
        is_finished,
        created_at: Utc::now(),
    })
}

async fn wait_for_join(
    code: &SessionCode,
    inbound: &mut mpsc::UnboundedReceiver<ServerMessage>,
) -> Result<()> {
    while let Some(message) = inbound.recv().await {
        match message {
            ServerMessage::WaitingForApproval { session_code } if &session_code == code => {
                return Ok(());
            }
            ServerMessage::SessionError { message } => bail!("relay refused the join: {message}"),
            other => debug!("Ignoring relay message {:?} while joining", other),
        }
    }
    bail!("relay connection closed before the join was acknowledged")
}
