//! Per-connection handler: registration, message routing, and cleanup.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Register the client with the orchestrator → get a `ClientId`
//!   2. Spawn a writer that drains the client's outbox onto the socket
//!   3. Loop: receive frames → decode → join / leave / heartbeat
//!   4. On close, error, or idle timeout → disconnect the client

use std::sync::Arc;

use slotkeeper_orchestrator::{Orchestrator, SessionBackend};
use slotkeeper_protocol::{ClientId, ClientMessage, Codec, ErrorCode, ServerMessage};
use slotkeeper_transport::{Connection, WebSocketConnection};
use tokio::sync::mpsc;

use crate::SlotkeeperError;
use crate::server::ServerState;

/// Close code for a connection that went quiet for too long.
pub const CLOSE_IDLE: u16 = 4008;

/// Drop guard that disconnects the client when the handler exits.
///
/// This ensures cleanup happens even if the handler panics. Since `Drop`
/// is synchronous, we spawn a fire-and-forget task for the async call.
struct ClientGuard<B: SessionBackend> {
    client: ClientId,
    orchestrator: Orchestrator<B>,
}

impl<B: SessionBackend> Drop for ClientGuard<B> {
    fn drop(&mut self) {
        let client = self.client;
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            orchestrator.disconnect(client).await;
        });
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<B, C>(
    conn: WebSocketConnection,
    state: Arc<ServerState<B, C>>,
) -> Result<(), SlotkeeperError>
where
    B: SessionBackend,
    C: Codec,
{
    let conn = Arc::new(conn);
    let conn_id = conn.id();
    let peer = conn.peer().clone();
    let ip = peer.client_ip().to_string();

    let (outbox, inbox) = mpsc::unbounded_channel();
    let client = state
        .orchestrator
        .register_client(ip.clone(), peer.user_agent.clone(), outbox.clone())
        .await;
    let _guard = ClientGuard {
        client,
        orchestrator: state.orchestrator.clone(),
    };
    tracing::info!(%conn_id, client_id = %client, %ip, "client connected");

    let writer = tokio::spawn(write_outbox(
        Arc::clone(&conn),
        Arc::clone(&state),
        inbox,
        client,
    ));

    loop {
        let data = match tokio::time::timeout(state.idle_timeout, conn.recv()).await {
            Ok(Ok(Some(data))) => data,
            Ok(Ok(None)) => {
                tracing::info!(client_id = %client, "connection closed cleanly");
                break;
            }
            Ok(Err(e)) => {
                tracing::debug!(client_id = %client, error = %e, "recv error");
                break;
            }
            Err(_) => {
                tracing::info!(client_id = %client, "connection idle, closing");
                let _ = conn.close(CLOSE_IDLE, "Idle timeout").await;
                break;
            }
        };

        let msg: ClientMessage = match state.codec.decode(&data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(client_id = %client, error = %e, "failed to decode message");
                let _ = outbox.send(ServerMessage::error(
                    ErrorCode::InvalidMessage,
                    "Message could not be parsed.",
                ));
                continue;
            }
        };

        dispatch(&state.orchestrator, client, msg).await;
    }

    // Messages queued before the close still go out; the writer stops once
    // every sender (ours and the orchestrator's) is gone.
    drop(outbox);
    drop(_guard);
    let _ = writer.await;
    Ok(())
}

/// Routes one decoded client message to the orchestrator.
async fn dispatch<B: SessionBackend>(orch: &Orchestrator<B>, client: ClientId, msg: ClientMessage) {
    match msg {
        ClientMessage::JoinQueue { invite_token } => {
            let outcome = orch.join(client, invite_token).await;
            tracing::debug!(client_id = %client, ?outcome, "join_queue handled");
        }
        ClientMessage::LeaveQueue => orch.leave(client).await,
        ClientMessage::Heartbeat => orch.heartbeat(client).await,
    }
}

/// Encodes and sends everything addressed to `client` until its outbox
/// closes or the socket fails.
async fn write_outbox<B, C>(
    conn: Arc<WebSocketConnection>,
    state: Arc<ServerState<B, C>>,
    mut inbox: mpsc::UnboundedReceiver<ServerMessage>,
    client: ClientId,
) where
    B: SessionBackend,
    C: Codec,
{
    while let Some(msg) = inbox.recv().await {
        let text = match state.codec.encode(&msg) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(client_id = %client, error = %e, "failed to encode message");
                continue;
            }
        };
        if let Err(e) = conn.send(&text).await {
            tracing::debug!(client_id = %client, error = %e, "send failed");
            break;
        }
    }
}
