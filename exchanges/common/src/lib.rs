//! Pieces shared by the sending and receiving halves of a transfer: the
//! relay wire protocol, direct-channel framing, the negotiation state
//! machine and the transport seams it runs on.

mod control;
mod error;
mod event;
pub mod loopback;
mod negotiation;
mod relay;
mod signaling;
mod transport;

pub use control::{ControlMessage, Frame};
pub use error::TransferError;
pub use event::{
    ChannelSubscriber, ConnectionStatus, ReceivedFile, Subscribers, TransferEvent,
    TransferSubscriber, progress_percent,
};
pub use negotiation::{
    IceCandidate, NegotiationMessage, NegotiationRole, NegotiationState, Negotiator, SdpType,
    SessionDescription,
};
pub use relay::{ClientMessage, ServerMessage};
pub use signaling::RelayClient;
pub use transport::{
    ChannelMessage, DirectChannel, PeerConnection, PeerConnector, PeerEvent, RelayConnection,
    RelayLink, RelaySignaling, SignalingSink,
};
