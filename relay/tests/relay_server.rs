use std::{net::SocketAddr, time::Duration};

use codedrop_entities::SessionCode;
use codedrop_relay::{RelayConfig, server};
use codedropx_common::{
    ClientMessage, RelayClient, RelayConnection, SdpType, ServerMessage, SessionDescription,
};
use futures::{SinkExt, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

async fn spawn_relay(config: RelayConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::serve(listener, config, std::future::pending()));
    addr
}

async fn connect(addr: SocketAddr) -> RelayConnection {
    RelayClient::connect(&format!("ws://{addr}/ws"))
        .await
        .unwrap()
}

async fn next(connection: &mut RelayConnection) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(5), connection.inbound.recv())
        .await
        .expect("relay went quiet")
        .expect("relay closed the socket")
}

fn code() -> SessionCode {
    "ABCD1234".parse().unwrap()
}

/// Walks a sender and a receiver through create, join, accept and one
/// relayed offer over real websockets.
#[tokio::test]
async fn test_pairing_over_websockets() {
    let addr = spawn_relay(RelayConfig::default()).await;
    let mut sender = connect(addr).await;
    let mut receiver = connect(addr).await;

    sender
        .link
        .send(ClientMessage::CreateSession {
            session_code: code(),
        })
        .await
        .unwrap();
    assert_eq!(
        next(&mut sender).await,
        ServerMessage::SessionCreated {
            session_code: code()
        }
    );

    receiver
        .link
        .send(ClientMessage::JoinSession {
            session_code: code(),
        })
        .await
        .unwrap();
    assert_eq!(
        next(&mut receiver).await,
        ServerMessage::WaitingForApproval {
            session_code: code()
        }
    );
    let receiver_id = match next(&mut sender).await {
        ServerMessage::ConnectionRequest {
            receiver_id,
            session_code,
        } => {
            assert_eq!(session_code, code());
            receiver_id
        }
        other => panic!("expected a connection request, got {other:?}"),
    };

    sender
        .link
        .send(ClientMessage::AcceptConnection {
            session_code: code(),
            receiver_id,
        })
        .await
        .unwrap();
    let accepted = ServerMessage::ConnectionAccepted {
        session_code: code(),
    };
    assert_eq!(next(&mut sender).await, accepted);
    assert_eq!(next(&mut receiver).await, accepted);

    let offer = SessionDescription {
        kind: SdpType::Offer,
        sdp: "v=0".into(),
    };
    sender
        .link
        .send(ClientMessage::WebrtcOffer {
            session_code: code(),
            offer: offer.clone(),
        })
        .await
        .unwrap();
    assert_eq!(
        next(&mut receiver).await,
        ServerMessage::WebrtcOffer { offer }
    );
}

/// A second create with a taken code is refused without touching the first.
#[tokio::test]
async fn test_duplicate_code_is_refused() {
    let addr = spawn_relay(RelayConfig::default()).await;
    let mut first = connect(addr).await;
    let mut second = connect(addr).await;

    let create = ClientMessage::CreateSession {
        session_code: code(),
    };
    first.link.send(create.clone()).await.unwrap();
    assert!(matches!(
        next(&mut first).await,
        ServerMessage::SessionCreated { .. }
    ));

    second.link.send(create).await.unwrap();
    assert_eq!(
        next(&mut second).await,
        ServerMessage::SessionError {
            message: "Session code already exists".into()
        }
    );
}

/// Closing the sender's socket tears the session down and tells the receiver.
#[tokio::test]
async fn test_disconnect_notifies_the_other_side() {
    let addr = spawn_relay(RelayConfig::default()).await;
    let mut sender = connect(addr).await;
    let mut receiver = connect(addr).await;

    sender
        .link
        .send(ClientMessage::CreateSession {
            session_code: code(),
        })
        .await
        .unwrap();
    next(&mut sender).await;
    receiver
        .link
        .send(ClientMessage::JoinSession {
            session_code: code(),
        })
        .await
        .unwrap();
    next(&mut receiver).await;

    sender.link.close().await;
    assert_eq!(
        next(&mut receiver).await,
        ServerMessage::PeerDisconnected {
            session_code: code()
        }
    );

    // The code is free again.
    receiver
        .link
        .send(ClientMessage::JoinSession {
            session_code: code(),
        })
        .await
        .unwrap();
    assert_eq!(
        next(&mut receiver).await,
        ServerMessage::SessionError {
            message: "Session not found".into()
        }
    );
}

/// Unparseable frames get a session error and the socket stays usable.
#[tokio::test]
async fn test_invalid_json_is_answered() {
    let addr = spawn_relay(RelayConfig::default()).await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();

    ws.send(Message::Text("{not json".into())).await.unwrap();
    let reply = read_text(&mut ws).await;
    match serde_json::from_str::<ServerMessage>(&reply).unwrap() {
        ServerMessage::SessionError { message } => {
            assert!(message.starts_with("Invalid message"), "{message}")
        }
        other => panic!("expected a session error, got {other:?}"),
    }

    ws.send(Message::Text(
        r#"{"type":"create-session","sessionCode":"ABCD1234"}"#.into(),
    ))
    .await
    .unwrap();
    let reply = read_text(&mut ws).await;
    assert_eq!(
        serde_json::from_str::<ServerMessage>(&reply).unwrap(),
        ServerMessage::SessionCreated {
            session_code: code()
        }
    );
}

async fn read_text<S>(ws: &mut S) -> String
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("relay went quiet")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return text;
        }
    }
}

/// `/health` reports liveness as JSON and carries the hardening headers.
#[tokio::test]
async fn test_health_endpoint() {
    let addr = spawn_relay(RelayConfig::default()).await;
    let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert_eq!(headers["referrer-policy"], "strict-origin-when-cross-origin");

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "OK");
    assert!(body["timestamp"].is_string());
    assert!(body["uptime"].as_f64().unwrap() >= 0.0);
}

/// Hardening headers can be switched off in the config.
#[tokio::test]
async fn test_health_without_security_headers() {
    let config = RelayConfig {
        security_headers: false,
        ..RelayConfig::default()
    };
    let addr = spawn_relay(config).await;
    let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.headers().get("x-frame-options").is_none());
}
