//! Integration tests for the slotkeeper server, handler, and full connection flow.

mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use slotkeeper::{CLOSE_IDLE, CLOSE_RATE_LIMITED, Config, SlotkeeperServerBuilder};
use slotkeeper_invite::InviteRecord;
use slotkeeper_orchestrator::Orchestrator;
use slotkeeper_protocol::{ErrorCode, InviteReason, ServerMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use common::{Mocks, TestBackend, backend, local_config, seed_invite};

// =========================================================================
// Helpers
// =========================================================================

type ClientWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct Running {
    ws_addr: String,
    http_addr: String,
    orchestrator: Orchestrator<TestBackend>,
    mocks: Mocks,
}

/// Starts a server on random ports.
async fn start_server(config: Config) -> Running {
    let (backend, mocks) = backend();
    let server = SlotkeeperServerBuilder::new()
        .config(config)
        .build::<TestBackend>(backend)
        .await
        .expect("server should build");

    let ws_addr = server.local_addr().expect("ws addr").to_string();
    let http_addr = server.http_addr().expect("http addr").to_string();
    let orchestrator = server.orchestrator();

    tokio::spawn(async move {
        let _ = server.run().await;
    });

    // Give the accept loop a moment to start.
    tokio::time::sleep(Duration::from_millis(10)).await;
    Running {
        ws_addr,
        http_addr,
        orchestrator,
        mocks,
    }
}

async fn connect(addr: &str) -> ClientWs {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("should connect");
    ws
}

async fn send_text(ws: &mut ClientWs, text: &str) {
    ws.send(Message::Text(text.into())).await.expect("send");
}

/// Reads the next server message, failing the test after two seconds.
async fn next_message(ws: &mut ClientWs) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("server should reply in time")
            .expect("stream should be open")
            .expect("frame should be valid");
        match frame {
            Message::Text(text) => {
                return serde_json::from_str(text.as_str()).expect("server message");
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Reads messages until one matches `pred`.
async fn expect_message(ws: &mut ClientWs, pred: impl Fn(&ServerMessage) -> bool) -> ServerMessage {
    for _ in 0..10 {
        let msg = next_message(ws).await;
        if pred(&msg) {
            return msg;
        }
    }
    panic!("expected message never arrived");
}

async fn expect_close(ws: &mut ClientWs) -> Option<CloseCode> {
    let deadline = Duration::from_secs(3);
    let result = tokio::time::timeout(deadline, async {
        while let Some(frame) = ws.next().await {
            match frame {
                Ok(Message::Close(close)) => return close.map(|c| c.code),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    })
    .await;
    result.expect("connection should close")
}

// =========================================================================
// Queue flow
// =========================================================================

#[tokio::test]
async fn test_join_on_empty_server_starts_session() {
    let server = start_server(local_config()).await;
    let mut ws = connect(&server.ws_addr).await;

    send_text(&mut ws, r#"{"type":"join_queue"}"#).await;

    let token = match next_message(&mut ws).await {
        ServerMessage::SessionToken { session_token } => session_token,
        other => panic!("expected session_token, got {other:?}"),
    };
    let starting = expect_message(&mut ws, |m| matches!(m, ServerMessage::SessionStarting { .. })).await;
    let ServerMessage::SessionStarting {
        session_token,
        enabled_platforms,
        terminal_url,
        ..
    } = starting
    else {
        unreachable!();
    };
    assert_eq!(session_token, token);
    assert_eq!(enabled_platforms, vec!["jira".to_string()]);
    assert_eq!(terminal_url, "/terminal/");
    assert_eq!(server.mocks.supervisor.running(), 1);
}

#[tokio::test]
async fn test_second_client_is_queued_behind_session() {
    let server = start_server(local_config()).await;
    let mut first = connect(&server.ws_addr).await;
    send_text(&mut first, r#"{"type":"join_queue"}"#).await;
    expect_message(&mut first, |m| matches!(m, ServerMessage::SessionStarting { .. })).await;

    let mut second = connect(&server.ws_addr).await;
    send_text(&mut second, r#"{"type":"join_queue"}"#).await;

    let msg = expect_message(&mut second, |m| matches!(m, ServerMessage::QueuePosition { .. })).await;
    assert_eq!(
        msg,
        ServerMessage::QueuePosition {
            position: 1,
            queue_size: 1,
            estimated_wait: 60,
        }
    );
}

#[tokio::test]
async fn test_queued_client_promoted_when_session_ends() {
    let server = start_server(local_config()).await;
    let mut first = connect(&server.ws_addr).await;
    send_text(&mut first, r#"{"type":"join_queue"}"#).await;
    expect_message(&mut first, |m| matches!(m, ServerMessage::SessionStarting { .. })).await;

    let mut second = connect(&server.ws_addr).await;
    send_text(&mut second, r#"{"type":"join_queue"}"#).await;
    expect_message(&mut second, |m| matches!(m, ServerMessage::QueuePosition { .. })).await;

    send_text(&mut first, r#"{"type":"leave_queue"}"#).await;

    let ended = expect_message(&mut first, |m| matches!(m, ServerMessage::SessionEnded { .. })).await;
    assert!(matches!(
        ended,
        ServerMessage::SessionEnded {
            clear_session_cookie: true,
            ..
        }
    ));
    expect_message(&mut second, |m| matches!(m, ServerMessage::SessionStarting { .. })).await;
}

#[tokio::test]
async fn test_leave_queue_confirms() {
    let server = start_server(local_config()).await;
    let mut first = connect(&server.ws_addr).await;
    send_text(&mut first, r#"{"type":"join_queue"}"#).await;
    expect_message(&mut first, |m| matches!(m, ServerMessage::SessionStarting { .. })).await;

    let mut second = connect(&server.ws_addr).await;
    send_text(&mut second, r#"{"type":"join_queue"}"#).await;
    expect_message(&mut second, |m| matches!(m, ServerMessage::QueuePosition { .. })).await;
    send_text(&mut second, r#"{"type":"leave_queue"}"#).await;

    expect_message(&mut second, |m| *m == ServerMessage::LeftQueue).await;
    assert_eq!(server.orchestrator.status().await.queue_len, 0);
}

// =========================================================================
// Invites
// =========================================================================

#[tokio::test]
async fn test_join_with_unknown_invite_is_refused() {
    let mut config = local_config();
    config.queue.require_invite = true;
    let server = start_server(config).await;
    let mut ws = connect(&server.ws_addr).await;

    send_text(&mut ws, r#"{"type":"join_queue","inviteToken":"nobody-knows"}"#).await;

    let msg = next_message(&mut ws).await;
    assert!(matches!(
        msg,
        ServerMessage::InviteInvalid {
            reason: InviteReason::NotFound,
            ..
        }
    ));
    assert_eq!(server.mocks.supervisor.running(), 0);
}

#[tokio::test]
async fn test_join_with_valid_invite_starts_session() {
    let mut config = local_config();
    config.queue.require_invite = true;
    let server = start_server(config).await;
    seed_invite(&server.mocks.store, InviteRecord::new("team-invite-01")).await;
    let mut ws = connect(&server.ws_addr).await;

    send_text(&mut ws, r#"{"type":"join_queue","inviteToken":"team-invite-01"}"#).await;

    expect_message(&mut ws, |m| matches!(m, ServerMessage::SessionStarting { .. })).await;
}

#[tokio::test]
async fn test_join_without_invite_when_required_is_missing() {
    let mut config = local_config();
    config.queue.require_invite = true;
    let server = start_server(config).await;
    let mut ws = connect(&server.ws_addr).await;

    send_text(&mut ws, r#"{"type":"join_queue"}"#).await;

    let msg = next_message(&mut ws).await;
    assert!(matches!(
        msg,
        ServerMessage::InviteInvalid {
            reason: InviteReason::Missing,
            ..
        }
    ));
}

// =========================================================================
// Framing and liveness
// =========================================================================

#[tokio::test]
async fn test_heartbeat_is_acknowledged() {
    let server = start_server(local_config()).await;
    let mut ws = connect(&server.ws_addr).await;

    send_text(&mut ws, r#"{"type":"heartbeat"}"#).await;

    match next_message(&mut ws).await {
        ServerMessage::HeartbeatAck { server_time } => assert!(server_time > 0),
        other => panic!("expected heartbeat_ack, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_message_gets_invalid_message_error() {
    let server = start_server(local_config()).await;
    let mut ws = connect(&server.ws_addr).await;

    send_text(&mut ws, "{not json").await;

    match next_message(&mut ws).await {
        ServerMessage::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidMessage),
        other => panic!("expected error, got {other:?}"),
    }

    // The connection survives a bad frame.
    send_text(&mut ws, r#"{"type":"heartbeat"}"#).await;
    assert!(matches!(
        next_message(&mut ws).await,
        ServerMessage::HeartbeatAck { .. }
    ));
}

#[tokio::test]
async fn test_unknown_message_type_gets_invalid_message_error() {
    let server = start_server(local_config()).await;
    let mut ws = connect(&server.ws_addr).await;

    send_text(&mut ws, r#"{"type":"take_over_slot"}"#).await;

    assert!(matches!(
        next_message(&mut ws).await,
        ServerMessage::Error {
            code: ErrorCode::InvalidMessage,
            ..
        }
    ));
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let mut config = local_config();
    config.server.idle_timeout_secs = 1;
    let server = start_server(config).await;
    let mut ws = connect(&server.ws_addr).await;

    let code = expect_close(&mut ws).await;

    assert_eq!(code, Some(CloseCode::from(CLOSE_IDLE)));
}

#[tokio::test]
async fn test_disconnect_unregisters_client() {
    let server = start_server(local_config()).await;
    let mut ws = connect(&server.ws_addr).await;
    send_text(&mut ws, r#"{"type":"heartbeat"}"#).await;
    next_message(&mut ws).await;
    assert_eq!(server.orchestrator.status().await.clients, 1);

    ws.close(None).await.expect("close");
    drop(ws);

    let mut clients = 1;
    for _ in 0..100 {
        clients = server.orchestrator.status().await.clients;
        if clients == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(clients, 0);
}

#[tokio::test]
async fn test_connections_over_limit_are_closed() {
    let mut config = local_config();
    config.rate_limit.connections.max_attempts = 2;
    let server = start_server(config).await;

    let _a = connect(&server.ws_addr).await;
    let _b = connect(&server.ws_addr).await;
    let mut refused = connect(&server.ws_addr).await;

    let code = expect_close(&mut refused).await;

    assert_eq!(code, Some(CloseCode::from(CLOSE_RATE_LIMITED)));
}

#[tokio::test]
async fn test_silent_peer_does_not_stall_other_clients() {
    let server = start_server(local_config()).await;

    let _silent = tokio::net::TcpStream::connect(&server.ws_addr)
        .await
        .expect("ws listener reachable");

    let mut ws = tokio::time::timeout(Duration::from_secs(2), connect(&server.ws_addr))
        .await
        .expect("second peer upgraded while the first stays silent");
    send_text(&mut ws, r#"{"type":"join_queue"}"#).await;
    expect_message(&mut ws, |m| matches!(m, ServerMessage::SessionStarting { .. })).await;

    assert_eq!(server.mocks.supervisor.running(), 1);
}

#[tokio::test]
async fn test_http_api_is_served_alongside_websocket() {
    let server = start_server(local_config()).await;

    let stream = tokio::net::TcpStream::connect(&server.http_addr)
        .await
        .expect("http listener reachable");
    let (mut reader, mut writer) = stream.into_split();
    writer
        .write_all(b"GET /api/session/validate HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    reader.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 401"), "got: {response}");
}
