use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use codedrop_entities::SessionCode;
use codedropx_common::{
    ConnectionStatus, DirectChannel, Negotiator, PeerEvent, RelayLink, ServerMessage,
    Subscribers, TransferError, TransferEvent,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::Reassembler;

enum Step {
    Cancel(bool),
    Relay(Option<ServerMessage>),
    Peer(Option<PeerEvent>),
    Received(Result<(), TransferError>),
}

pub(crate) struct Carrier {
    pub(crate) code: SessionCode,
    pub(crate) link: Arc<dyn RelayLink>,
    pub(crate) inbound: mpsc::UnboundedReceiver<ServerMessage>,
    pub(crate) negotiator: Negotiator,
    pub(crate) subscribers: Subscribers,
    pub(crate) is_finished: Arc<AtomicBool>,
    pub(crate) cancel: watch::Receiver<bool>,
    pub(crate) peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    pub(crate) channel: Option<Arc<dyn DirectChannel>>,
    pub(crate) reader: Option<JoinHandle<Result<(), TransferError>>>,
}

impl Carrier {
    pub(crate) async fn run(mut self) {
        let status = match self.drive().await {
            Ok(status) => status,
            Err(err) => {
                error!(session = %self.code, "Receiving session failed: {}", err);
                ConnectionStatus::from(err)
            }
        };
        self.teardown().await;
        info!(session = %self.code, "Receiving session finished: {:?}", status);
        self.is_finished.store(true, Ordering::Release);
        self.subscribers.status(status);
    }

    async fn drive(&mut self) -> Result<ConnectionStatus, TransferError> {
        loop {
            let step = tokio::select! {
                biased;
                changed = self.cancel.changed() => Step::Cancel(changed.is_ok()),
                received = join_reader(&mut self.reader) => Step::Received(received),
                event = next_peer_event(&mut self.peer_events) => Step::Peer(event),
                message = self.inbound.recv() => Step::Relay(message),
            };

            match step {
                Step::Cancel(alive) => {
                    if alive && !*self.cancel.borrow() {
                        continue;
                    }
                    return Err(TransferError::Cancelled);
                }
                Step::Relay(Some(message)) => {
                    if let Some(status) = self.on_relay(message).await? {
                        return Ok(status);
                    }
                }
                Step::Relay(None) => {
                    return Err(TransferError::Signaling("relay connection closed".into()));
                }
                Step::Peer(Some(event)) => self.on_peer(event).await?,
                Step::Peer(None) => self.peer_events = None,
                Step::Received(result) => {
                    self.reader = None;
                    result?;
                    return Ok(ConnectionStatus::Completed);
                }
            }
        }
    }

    async fn on_relay(
        &mut self,
        message: ServerMessage,
    ) -> Result<Option<ConnectionStatus>, TransferError> {
        match message {
            ServerMessage::ConnectionAccepted { .. }
                if self.subscribers.current_status()
                    != Some(ConnectionStatus::WaitingForApproval) =>
            {
                debug!(session = %self.code, "Already accepted, ignoring repeated accept");
            }
            ServerMessage::ConnectionAccepted { .. } => {
                info!(session = %self.code, "Sender accepted, waiting for offer");
                self.subscribers.status(ConnectionStatus::Connecting);
            }
            ServerMessage::ConnectionRejected { .. } => {
                info!(session = %self.code, "Sender rejected the connection");
                return Err(TransferError::SessionRejected);
            }
            ServerMessage::WebrtcOffer { offer } => {
                let events = self.negotiator.accept_offer(offer).await?;
                self.peer_events = Some(events);
            }
            ServerMessage::WebrtcIceCandidate { candidate } => {
                self.negotiator.add_remote_candidate(candidate).await;
            }
            ServerMessage::PeerDisconnected { .. } => {
                warn!(session = %self.code, "Sender disconnected");
                return Err(TransferError::PeerDisconnected);
            }
            ServerMessage::SessionError { message } => {
                error!(session = %self.code, "Relay error: {}", message);
                return Err(TransferError::SessionError(message));
            }
            ServerMessage::TransferComplete { .. } => {
                debug!(session = %self.code, "Sender reported the batch as sent");
            }
            other => debug!(session = %self.code, "Ignoring relay message {:?}", other),
        }
        Ok(None)
    }

    async fn on_peer(&mut self, event: PeerEvent) -> Result<(), TransferError> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.negotiator.on_local_candidate(candidate).await?;
            }
            PeerEvent::ChannelOpen(channel) => {
                self.negotiator.on_channel_open();
                self.subscribers.notify(TransferEvent::ChannelReady);
                self.subscribers.status(ConnectionStatus::Connected);
                self.start_reader(channel);
            }
            PeerEvent::Failed(reason) => return Err(self.negotiator.fail(reason)),
            PeerEvent::Closed => return Err(TransferError::ChannelClosed),
        }
        Ok(())
    }

    fn start_reader(&mut self, channel: Arc<dyn DirectChannel>) {
        if self.reader.is_some() {
            warn!(session = %self.code, "Direct channel reopened, ignoring");
            return;
        }
        self.channel = Some(channel.clone());
        let subscribers = self.subscribers.clone();
        self.reader = Some(tokio::spawn(async move {
            read_batch(channel.as_ref(), &subscribers).await
        }));
    }

    async fn teardown(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        self.negotiator.close().await;
        self.link.close().await;
    }
}

/// Feeds the channel into a [`Reassembler`] until `transfer-complete`.
async fn read_batch(
    channel: &dyn DirectChannel,
    subscribers: &Subscribers,
) -> Result<(), TransferError> {
    let mut reassembler = Reassembler::new();
    while let Some(message) = channel.recv().await {
        for event in reassembler.handle(message)? {
            subscribers.notify(event);
        }
        if reassembler.is_finished() {
            return Ok(());
        }
    }
    Err(TransferError::ChannelClosed)
}

async fn next_peer_event(
    events: &mut Option<mpsc::UnboundedReceiver<PeerEvent>>,
) -> Option<PeerEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn join_reader(
    reader: &mut Option<JoinHandle<Result<(), TransferError>>>,
) -> Result<(), TransferError> {
    match reader {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(err) => Err(TransferError::Protocol(format!("receive task failed: {err}"))),
        },
        None => std::future::pending().await,
    }
}
