//! Websocket client for the relay.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{net::TcpStream, sync::Mutex, sync::mpsc};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use tracing::{debug, info, warn};

use crate::{
    TransferError,
    relay::{ClientMessage, ServerMessage},
    transport::{RelayConnection, RelayLink},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// [`RelayLink`] over a websocket connection to the relay's `/ws` endpoint.
#[derive(Clone)]
pub struct RelayClient {
    writer: Arc<Mutex<WsWrite>>,
}

impl RelayClient {
    /// Connects to `url` (e.g. `ws://127.0.0.1:3001/ws`) and starts the
    /// reader task. Inbound messages are delivered on the returned
    /// connection until the relay closes the socket.
    pub async fn connect(url: &str) -> Result<RelayConnection, TransferError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|err| TransferError::Signaling(format!("relay connect failed: {err}")))?;
        info!("Connected to relay at {}", url);

        let (ws_write, ws_read) = ws_stream.split();
        let client = RelayClient {
            writer: Arc::new(Mutex::new(ws_write)),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_reader(ws_read, client.clone(), tx);

        Ok(RelayConnection {
            link: Arc::new(client),
            inbound: rx,
        })
    }

    async fn send_raw(&self, message: Message) {
        let mut writer = self.writer.lock().await;
        let _ = writer.send(message).await;
    }
}

#[async_trait]
impl RelayLink for RelayClient {
    async fn send(&self, message: ClientMessage) -> Result<(), TransferError> {
        let text = serde_json::to_string(&message)?;
        debug!("Relay <- {}", text);
        let mut writer = self.writer.lock().await;
        writer
            .send(Message::Text(text))
            .await
            .map_err(|err| TransferError::Signaling(format!("relay send failed: {err}")))
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.send(Message::Close(None)).await;
    }
}

fn spawn_reader(
    mut ws_read: WsRead,
    client: RelayClient,
    tx: mpsc::UnboundedSender<ServerMessage>,
) {
    tokio::spawn(async move {
        while let Some(msg) = ws_read.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => {
                        debug!("Relay -> {}", text);
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("Invalid relay payload: {}", err),
                },
                Ok(Message::Ping(payload)) => client.send_raw(Message::Pong(payload)).await,
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!("Relay stream error: {}", err);
                    break;
                }
            }
        }
        debug!("Relay reader finished");
    });
}
