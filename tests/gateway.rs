//! End-to-end tests driving a real WebSocket client against the gateway

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{client_async, connect_async, MaybeTlsStream, WebSocketStream};

use mcp_ws_gateway::protocol::{JsonRpcResponse, RequestId, Version};
use mcp_ws_gateway::{
    ConnectionHandle, GatewayConfig, GatewayError, JsonRpcMessage, ProtocolError, SendError,
    TransportError, WebSocketGateway, SUBPROTOCOL,
};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Events {
    connects: mpsc::UnboundedReceiver<ConnectionHandle>,
    messages: mpsc::UnboundedReceiver<JsonRpcMessage>,
    closes: mpsc::UnboundedReceiver<()>,
    errors: mpsc::UnboundedReceiver<TransportError>,
}

fn wire_events(gateway: &WebSocketGateway) -> Events {
    let (connect_tx, connects) = mpsc::unbounded_channel();
    let (message_tx, messages) = mpsc::unbounded_channel();
    let (close_tx, closes) = mpsc::unbounded_channel();
    let (error_tx, errors) = mpsc::unbounded_channel();

    gateway.on_connect(move |handle| {
        let _ = connect_tx.send(handle);
    });
    gateway.on_message(move |message| {
        let _ = message_tx.send(message);
    });
    gateway.on_close(move || {
        let _ = close_tx.send(());
    });
    gateway.on_error(move |error| {
        let _ = error_tx.send(error);
    });

    Events {
        connects,
        messages,
        closes,
        errors,
    }
}

async fn start_gateway() -> (WebSocketGateway, Events, SocketAddr) {
    let gateway = WebSocketGateway::new(GatewayConfig::new(0).with_host("127.0.0.1"));
    let events = wire_events(&gateway);
    gateway.start().await.expect("gateway should start");
    let addr = gateway.local_addr().expect("gateway should be bound");
    (gateway, events, addr)
}

async fn connect(
    addr: SocketAddr,
    subprotocol: Option<&str>,
) -> Result<WsClient, tungstenite::Error> {
    let mut request = format!("ws://{addr}")
        .into_client_request()
        .expect("valid client request");
    if let Some(token) = subprotocol {
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_str(token).expect("valid header value"),
        );
    }
    connect_async(request).await.map(|(client, _)| client)
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

fn assert_no_event<T>(rx: &mut mpsc::UnboundedReceiver<T>) {
    assert!(matches!(
        rx.try_recv(),
        Err(mpsc::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn end_to_end_ping_pong() {
    let (gateway, mut events, addr) = start_gateway().await;

    let mut client = connect(addr, Some(SUBPROTOCOL))
        .await
        .expect("client should connect");
    let handle = recv(&mut events.connects).await;
    assert_eq!(gateway.connection(), Some(handle));
    assert!(gateway.is_connected());

    client
        .send(Message::text(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#))
        .await
        .unwrap();
    let received = recv(&mut events.messages).await;
    let expected =
        JsonRpcMessage::from_text(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#).unwrap();
    assert_eq!(received, expected);

    let response = JsonRpcMessage::Response(JsonRpcResponse {
        jsonrpc: Version,
        id: RequestId::Number(1),
        result: json!("pong"),
    });
    gateway.send(&response).await.expect("send should succeed");

    let frame = timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for frame")
        .expect("stream ended")
        .expect("frame error");
    match frame {
        Message::Text(text) => {
            let value: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(value, json!({"jsonrpc":"2.0","result":"pong","id":1}));
        }
        other => panic!("expected text frame, got {other:?}"),
    }

    client.close(None).await.unwrap();
    recv(&mut events.closes).await;
    assert!(gateway.connection().is_none());
    assert!(!gateway.is_connected());

    gateway.close().await;
}

#[tokio::test]
async fn rejects_missing_subprotocol_with_1002() {
    let (gateway, mut events, addr) = start_gateway().await;

    let mut client = connect(addr, None).await.expect("upgrade should complete");
    let frame = timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for close")
        .expect("stream ended")
        .expect("frame error");
    match frame {
        Message::Close(Some(close)) => {
            assert_eq!(close.code, CloseCode::Protocol);
            assert_eq!(close.reason, "Unsupported protocol");
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    assert_no_event(&mut events.connects);
    assert!(gateway.connection().is_none());

    gateway.close().await;
}

#[tokio::test]
async fn rejects_wrong_subprotocol() {
    let (gateway, mut events, addr) = start_gateway().await;

    // The server answers the upgrade without selecting a protocol and then
    // closes with 1002. Depending on client-side validation this surfaces as
    // a handshake error or as the close frame itself.
    match connect(addr, Some("bogus")).await {
        Err(_) => {}
        Ok(mut client) => {
            let frame = timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for close")
                .expect("stream ended")
                .expect("frame error");
            match frame {
                Message::Close(Some(close)) => assert_eq!(close.code, CloseCode::Protocol),
                other => panic!("expected close frame, got {other:?}"),
            }
        }
    }

    assert_no_event(&mut events.connects);
    assert!(gateway.connection().is_none());

    gateway.close().await;
}

#[tokio::test]
async fn bad_frames_do_not_kill_the_connection() {
    let (gateway, mut events, addr) = start_gateway().await;
    let mut client = connect(addr, Some(SUBPROTOCOL)).await.unwrap();
    recv(&mut events.connects).await;

    // Unparseable frame: one error event, no message event
    client.send(Message::text("not json")).await.unwrap();
    let fault = recv(&mut events.errors).await;
    assert!(matches!(
        fault,
        TransportError::Decode(ProtocolError::Parse(_))
    ));

    // Well-formed JSON that is not a JSON-RPC envelope
    client
        .send(Message::text(r#"{"jsonrpc":"2.0"}"#))
        .await
        .unwrap();
    let fault = recv(&mut events.errors).await;
    assert!(matches!(
        fault,
        TransportError::Decode(ProtocolError::Schema(_))
    ));

    // The connection is still healthy: the next good frame is delivered
    client
        .send(Message::text(
            r#"{"jsonrpc":"2.0","method":"tools/list","id":2}"#,
        ))
        .await
        .unwrap();
    let message = recv(&mut events.messages).await;
    match message {
        JsonRpcMessage::Request(request) => assert_eq!(request.method, "tools/list"),
        other => panic!("expected request, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_no_event(&mut events.errors);
    assert_no_event(&mut events.messages);
    assert_no_event(&mut events.closes);

    gateway.close().await;
}

#[tokio::test]
async fn send_fails_after_connection_closes() {
    let (gateway, mut events, addr) = start_gateway().await;
    let mut client = connect(addr, Some(SUBPROTOCOL)).await.unwrap();
    recv(&mut events.connects).await;

    client.close(None).await.unwrap();
    recv(&mut events.closes).await;

    let message =
        JsonRpcMessage::from_text(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#).unwrap();
    assert!(matches!(
        gateway.send(&message).await,
        Err(SendError::NoConnection)
    ));

    gateway.close().await;
}

#[tokio::test]
async fn newest_connection_wins_the_slot() {
    let (gateway, mut events, addr) = start_gateway().await;

    let mut first = connect(addr, Some(SUBPROTOCOL)).await.unwrap();
    let first_handle = recv(&mut events.connects).await;

    let mut second = connect(addr, Some(SUBPROTOCOL)).await.unwrap();
    let second_handle = recv(&mut events.connects).await;

    assert_ne!(first_handle.id, second_handle.id);
    assert_eq!(gateway.connection(), Some(second_handle));

    // The superseded peer is explicitly closed, without a close event for it
    let frame = timeout(Duration::from_secs(5), first.next())
        .await
        .expect("timed out waiting for supersede close");
    match frame {
        Some(Ok(Message::Close(_))) | None => {}
        other => panic!("expected close on superseded peer, got {other:?}"),
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_no_event(&mut events.closes);

    // Outbound traffic goes to the newest peer
    let response = JsonRpcMessage::Response(JsonRpcResponse {
        jsonrpc: Version,
        id: RequestId::Number(9),
        result: json!({"ok": true}),
    });
    gateway.send(&response).await.unwrap();
    let frame = timeout(Duration::from_secs(5), second.next())
        .await
        .expect("timed out waiting for frame")
        .expect("stream ended")
        .expect("frame error");
    assert!(matches!(frame, Message::Text(_)));

    second.close(None).await.unwrap();
    recv(&mut events.closes).await;
    assert!(gateway.connection().is_none());

    gateway.close().await;
}

#[tokio::test]
async fn bind_failure_notifies_caller_and_observer() {
    let (occupant, _events, addr) = start_gateway().await;

    let gateway = WebSocketGateway::new(GatewayConfig::new(addr.port()).with_host("127.0.0.1"));
    let mut events = wire_events(&gateway);

    let result = gateway.start().await;
    match result {
        Err(GatewayError::Bind { source, .. }) => {
            let observed = recv(&mut events.errors).await;
            match observed {
                TransportError::Bind(io_err) => assert_eq!(io_err.kind(), source.kind()),
                other => panic!("expected bind fault, got {other:?}"),
            }
        }
        other => panic!("expected bind error, got {other:?}"),
    }

    occupant.close().await;
}

#[tokio::test]
async fn handshake_completing_after_close_is_turned_away() {
    let (gateway, mut events, addr) = start_gateway().await;

    // Open the TCP stream so the listener accepts it, but hold the WebSocket
    // handshake back until the gateway has fully torn down.
    let stream = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    gateway.close().await;

    let mut request = format!("ws://{addr}")
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(SUBPROTOCOL),
    );
    let (mut client, _) = client_async(request, stream)
        .await
        .expect("upgrade should complete");

    // The late peer never occupies the slot and is disconnected immediately
    let frame = timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for close");
    match frame {
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {}
        other => panic!("expected closed stream, got {other:?}"),
    }

    assert!(gateway.connection().is_none());
    assert_no_event(&mut events.connects);
    assert_no_event(&mut events.closes);
}

#[tokio::test]
async fn no_dispatch_after_force_close() {
    let (gateway, mut events, addr) = start_gateway().await;
    let mut client = connect(addr, Some(SUBPROTOCOL)).await.unwrap();
    recv(&mut events.connects).await;

    // Keep the wire busy while the gateway is torn down
    let writer = tokio::spawn(async move {
        loop {
            let frame = Message::text(r#"{"jsonrpc":"2.0","method":"tick"}"#);
            if client.send(frame).await.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
    });
    recv(&mut events.messages).await;

    gateway.close().await;
    recv(&mut events.closes).await;

    // The reader is stopped before close() resolves: whatever it delivered
    // is already queued, and nothing more may arrive afterwards.
    while events.messages.try_recv().is_ok() {}
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_no_event(&mut events.messages);
    assert_no_event(&mut events.errors);

    writer.abort();
}

#[tokio::test]
async fn close_tears_down_the_active_connection() {
    let (gateway, mut events, addr) = start_gateway().await;
    let mut client = connect(addr, Some(SUBPROTOCOL)).await.unwrap();
    recv(&mut events.connects).await;

    gateway.close().await;
    recv(&mut events.closes).await;
    assert!(gateway.connection().is_none());

    // The peer observes the forced close
    let frame = timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for close");
    match frame {
        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {}
        other => panic!("expected closed stream, got {other:?}"),
    }

    // Idempotent: a second close is a no-op
    gateway.close().await;
}
