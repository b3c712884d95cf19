use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use codedrop_entities::{File, SessionCode};
use codedropx_common::{
    ClientMessage, ConnectionStatus, DirectChannel, NegotiationState, Negotiator, PeerEvent,
    RelayLink, ServerMessage, Subscribers, TransferError, TransferEvent,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use super::pump;
use crate::SenderConfig;

/// Requests from the session handle that change what the session shows.
#[derive(Debug)]
pub(crate) enum Command {
    Reject(String),
}

enum Step {
    Cancel(bool),
    Command(Option<Command>),
    Relay(Option<ServerMessage>),
    Peer(Option<PeerEvent>),
    Pumped(Result<(), TransferError>),
    Drained(Result<(), TransferError>),
}

/// Drives one sending session from `waiting-for-peer` to a terminal status.
pub(crate) struct Carrier {
    pub(crate) code: SessionCode,
    pub(crate) files: Vec<File>,
    pub(crate) config: SenderConfig,
    pub(crate) link: Arc<dyn RelayLink>,
    pub(crate) inbound: mpsc::UnboundedReceiver<ServerMessage>,
    pub(crate) relay_open: bool,
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) negotiator: Negotiator,
    pub(crate) subscribers: Subscribers,
    pub(crate) is_finished: Arc<AtomicBool>,
    pub(crate) cancel: watch::Receiver<bool>,
    pub(crate) peer_events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
    pub(crate) channel: Option<Arc<dyn DirectChannel>>,
    pub(crate) pump: Option<JoinHandle<Result<(), TransferError>>>,
    pub(crate) batch_sent: bool,
}

impl Carrier {
    pub(crate) async fn run(mut self) {
        let status = match self.drive().await {
            Ok(status) => status,
            Err(err) => {
                error!(session = %self.code, "Sending session failed: {}", err);
                ConnectionStatus::from(err)
            }
        };
        self.teardown().await;
        info!(session = %self.code, "Sending session finished: {:?}", status);
        self.is_finished.store(true, Ordering::Release);
        self.subscribers.status(status);
    }

    async fn drive(&mut self) -> Result<ConnectionStatus, TransferError> {
        loop {
            let step = tokio::select! {
                biased;
                changed = self.cancel.changed() => Step::Cancel(changed.is_ok()),
                pumped = join_pump(&mut self.pump) => Step::Pumped(pumped),
                drained = drained(
                    self.channel.as_ref(),
                    self.batch_sent,
                    self.config.backlog_poll_interval,
                ) => Step::Drained(drained),
                command = self.commands.recv() => Step::Command(command),
                event = next_peer_event(&mut self.peer_events) => Step::Peer(event),
                message = self.inbound.recv(), if self.relay_open => Step::Relay(message),
            };

            let outcome = match step {
                Step::Cancel(alive) => {
                    if alive && !*self.cancel.borrow() {
                        continue;
                    }
                    return Err(TransferError::Cancelled);
                }
                Step::Command(Some(command)) => {
                    self.on_command(command).await?;
                    None
                }
                Step::Command(None) => return Err(TransferError::Cancelled),
                Step::Relay(Some(message)) => self.on_relay(message).await?,
                Step::Relay(None) if self.batch_sent => {
                    debug!(session = %self.code, "Relay gone after the batch was sent");
                    self.relay_open = false;
                    None
                }
                Step::Relay(None) => {
                    return Err(TransferError::Signaling("relay connection closed".into()));
                }
                Step::Peer(Some(event)) => self.on_peer(event).await?,
                Step::Peer(None) => {
                    self.peer_events = None;
                    None
                }
                Step::Pumped(result) => {
                    self.pump = None;
                    result?;
                    self.on_batch_sent().await;
                    None
                }
                Step::Drained(result) => {
                    result?;
                    info!(session = %self.code, "Receiver took every frame");
                    Some(ConnectionStatus::Completed)
                }
            };
            if let Some(status) = outcome {
                return Ok(status);
            }
        }
    }

    async fn on_command(&mut self, command: Command) -> Result<(), TransferError> {
        match command {
            Command::Reject(receiver_id) => {
                info!(session = %self.code, peer = %receiver_id, "Rejecting receiver");
                self.link
                    .send(ClientMessage::RejectConnection {
                        session_code: self.code.clone(),
                        receiver_id,
                    })
                    .await?;
                self.subscribers.status(ConnectionStatus::WaitingForPeer);
            }
        }
        Ok(())
    }

    async fn on_relay(
        &mut self,
        message: ServerMessage,
    ) -> Result<Option<ConnectionStatus>, TransferError> {
        match message {
            ServerMessage::ConnectionRequest { receiver_id, .. } => {
                info!(session = %self.code, peer = %receiver_id, "Connection requested");
                self.subscribers
                    .status(ConnectionStatus::ConnectionRequested { receiver_id });
            }
            ServerMessage::ConnectionAccepted { .. }
                if *self.negotiator.state() != NegotiationState::Idle =>
            {
                debug!(session = %self.code, "Already negotiating, ignoring repeated accept");
            }
            ServerMessage::ConnectionAccepted { .. } => {
                info!(session = %self.code, "Receiver accepted, negotiating");
                self.subscribers.status(ConnectionStatus::Connecting);
                let events = self.negotiator.start().await?;
                self.peer_events = Some(events);
            }
            ServerMessage::WebrtcAnswer { answer } => {
                self.negotiator.accept_answer(answer).await?;
            }
            ServerMessage::WebrtcIceCandidate { candidate } => {
                self.negotiator.add_remote_candidate(candidate).await;
            }
            ServerMessage::PeerDisconnected { .. } => {
                // The receiver may hang up as soon as it has the last frame.
                if !self.batch_sent && self.pump.as_ref().is_some_and(JoinHandle::is_finished) {
                    let pumped = join_pump(&mut self.pump).await;
                    self.pump = None;
                    pumped?;
                    self.on_batch_sent().await;
                }
                if self.batch_sent {
                    debug!(session = %self.code, "Receiver left after the batch was sent");
                    return Ok(None);
                }
                warn!(session = %self.code, "Receiver disconnected");
                return Ok(Some(ConnectionStatus::PeerDisconnected));
            }
            ServerMessage::SessionError { message } => {
                error!(session = %self.code, "Relay error: {}", message);
                return Err(TransferError::SessionError(message));
            }
            other => debug!(session = %self.code, "Ignoring relay message {:?}", other),
        }
        Ok(None)
    }

    async fn on_peer(
        &mut self,
        event: PeerEvent,
    ) -> Result<Option<ConnectionStatus>, TransferError> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.negotiator.on_local_candidate(candidate).await?;
            }
            PeerEvent::ChannelOpen(channel) => {
                self.negotiator.on_channel_open();
                self.subscribers.notify(TransferEvent::ChannelReady);
                self.subscribers.status(ConnectionStatus::Connected);
                self.start_pump(channel);
            }
            PeerEvent::Failed(reason) => return Err(self.negotiator.fail(reason)),
            PeerEvent::Closed if !self.batch_sent => return Err(TransferError::ChannelClosed),
            PeerEvent::Closed => {}
        }
        Ok(None)
    }

    fn start_pump(&mut self, channel: Arc<dyn DirectChannel>) {
        if self.pump.is_some() || self.batch_sent {
            warn!(session = %self.code, "Direct channel reopened, ignoring");
            return;
        }
        self.channel = Some(channel.clone());
        let files = self.files.clone();
        let config = self.config.clone();
        let subscribers = self.subscribers.clone();
        self.pump = Some(tokio::spawn(async move {
            pump::send_batch(channel.as_ref(), &files, &config, &subscribers).await
        }));
    }

    /// Tells the relay the batch is out so it can drop the session. The
    /// session itself ends once the channel backlog drains, whether or not
    /// the relay still knows about it.
    async fn on_batch_sent(&mut self) {
        self.batch_sent = true;
        self.subscribers.notify(TransferEvent::TransferComplete);
        if !self.relay_open {
            return;
        }
        let notice = ClientMessage::TransferComplete {
            session_code: self.code.clone(),
        };
        if let Err(err) = self.link.send(notice).await {
            warn!(session = %self.code, "Could not notify relay of completion: {}", err);
        }
    }

    async fn teardown(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        self.negotiator.close().await;
        self.link.close().await;
    }
}

async fn next_peer_event(
    events: &mut Option<mpsc::UnboundedReceiver<PeerEvent>>,
) -> Option<PeerEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

/// Resolves once the peer has taken everything queued on the channel. Pending
/// until the batch has been sent.
async fn drained(
    channel: Option<&Arc<dyn DirectChannel>>,
    batch_sent: bool,
    poll: Duration,
) -> Result<(), TransferError> {
    let Some(channel) = channel.filter(|_| batch_sent) else {
        return std::future::pending().await;
    };
    loop {
        if channel.buffered_amount() == 0 {
            return Ok(());
        }
        if !channel.is_open() {
            return Err(TransferError::ChannelClosed);
        }
        tokio::time::sleep(poll).await;
    }
}

async fn join_pump(
    pump: &mut Option<JoinHandle<Result<(), TransferError>>>,
) -> Result<(), TransferError> {
    match pump {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(err) => Err(TransferError::Protocol(format!("send task failed: {err}"))),
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use codedropx_common::{
        ChannelMessage, NegotiationRole, RelaySignaling,
        loopback::{LoopbackNetwork, channel_pair},
    };

    struct QuietRelay;

    #[async_trait]
    impl RelayLink for QuietRelay {
        async fn send(&self, _message: ClientMessage) -> Result<(), TransferError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    /// Open channel whose peer never takes anything.
    struct StalledChannel;

    #[async_trait]
    impl DirectChannel for StalledChannel {
        async fn send(&self, _message: ChannelMessage) -> Result<(), TransferError> {
            Ok(())
        }

        async fn recv(&self) -> Option<ChannelMessage> {
            std::future::pending().await
        }

        fn buffered_amount(&self) -> u64 {
            100
        }

        fn is_open(&self) -> bool {
            true
        }

        async fn close(&self) {}
    }

    struct Harness {
        cancel: watch::Sender<bool>,
        relay: mpsc::UnboundedSender<ServerMessage>,
        subscribers: Subscribers,
        is_finished: Arc<AtomicBool>,
        _commands: mpsc::UnboundedSender<Command>,
    }

    /// A carrier whose batch is already on `channel`.
    fn spawn_after_batch(channel: Arc<dyn DirectChannel>) -> Harness {
        let code: SessionCode = "ABCD1234".parse().unwrap();
        let link: Arc<dyn RelayLink> = Arc::new(QuietRelay);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let subscribers = Subscribers::new();
        let is_finished = Arc::new(AtomicBool::new(false));

        let carrier = Carrier {
            code: code.clone(),
            files: Vec::new(),
            config: SenderConfig {
                backlog_poll_interval: Duration::from_millis(5),
                ..SenderConfig::default()
            },
            link: link.clone(),
            inbound: relay_rx,
            relay_open: true,
            commands: commands_rx,
            negotiator: Negotiator::new(
                NegotiationRole::Initiator,
                Arc::new(LoopbackNetwork::new()),
                Arc::new(RelaySignaling::new(link, code)),
            ),
            subscribers: subscribers.clone(),
            is_finished: is_finished.clone(),
            cancel: cancel_rx,
            peer_events: None,
            channel: Some(channel),
            pump: None,
            batch_sent: true,
        };
        tokio::spawn(carrier.run());

        Harness {
            cancel: cancel_tx,
            relay: relay_tx,
            subscribers,
            is_finished,
            _commands: commands_tx,
        }
    }

    async fn wait_finished(harness: &Harness) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !harness.is_finished.load(Ordering::Acquire) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session did not finish");
    }

    #[tokio::test]
    async fn cancel_interrupts_the_final_drain() {
        let harness = spawn_after_batch(Arc::new(StalledChannel));
        harness
            .relay
            .send(ServerMessage::TransferComplete {
                session_code: "ABCD1234".parse().unwrap(),
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!harness.is_finished.load(Ordering::Acquire));

        harness.cancel.send(true).unwrap();
        wait_finished(&harness).await;
        assert_eq!(
            harness.subscribers.current_status(),
            Some(ConnectionStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn finishes_once_drained_without_a_relay_echo() {
        let (local, remote) = channel_pair();
        local
            .send(ChannelMessage::Binary(vec![0; 64]))
            .await
            .unwrap();
        let harness = spawn_after_batch(Arc::new(local));

        // The relay never echoes completion.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!harness.is_finished.load(Ordering::Acquire));

        assert!(remote.recv().await.is_some());
        wait_finished(&harness).await;
        assert_eq!(
            harness.subscribers.current_status(),
            Some(ConnectionStatus::Completed)
        );
    }

    #[tokio::test]
    async fn peer_closing_with_frames_queued_is_an_error() {
        let (local, remote) = channel_pair();
        local
            .send(ChannelMessage::Binary(vec![0; 64]))
            .await
            .unwrap();
        let harness = spawn_after_batch(Arc::new(local));

        remote.close().await;
        wait_finished(&harness).await;
        assert!(matches!(
            harness.subscribers.current_status(),
            Some(ConnectionStatus::Failed { .. })
        ));
    }
}
