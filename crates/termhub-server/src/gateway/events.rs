//! Registry-scoped endpoint: lifecycle events and session management.

use super::{credentials, CLOSE_NORMAL};
use crate::auth::{AuthGrant, Authenticator};
use crate::session::{EventSubscription, SessionRegistry};
use crate::transport::websocket::{close_with, send_message};
use crate::transport::{WebSocketConnection, WsStream};
use futures_util::{SinkExt, StreamExt};
use termhub_core::messages::{ErrorBody, KeyGrant, SessionRef};
use termhub_core::{ControlMessage, ServerMessage, TermhubResult, CLOSE_AUTH_FAILED};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Serve an `/events` connection until either side goes away.
pub async fn serve(
    mut conn: WebSocketConnection,
    registry: &SessionRegistry,
    auth: &Authenticator,
) {
    let remote = conn.remote_addr;

    let grant = match auth.authenticate(&credentials(&conn.request)) {
        Ok(grant) => grant,
        Err(e) => {
            warn!(remote = %remote, error = %e, "events connection refused");
            close_with(&mut conn.ws_stream, CLOSE_AUTH_FAILED, "authentication failed").await;
            return;
        }
    };

    let subscription = registry.subscribe().await;
    let observer_id = subscription.observer_id;
    info!(remote = %remote, ?grant, observer = observer_id, "events channel attached");

    let result = run(&mut conn.ws_stream, registry, auth, grant, subscription).await;
    if let Err(e) = result {
        debug!(remote = %remote, error = %e, "events connection ended with error");
    }

    registry.unsubscribe(observer_id);
    info!(remote = %remote, observer = observer_id, "events channel detached");
}

async fn run(
    ws: &mut WsStream,
    registry: &SessionRegistry,
    auth: &Authenticator,
    grant: AuthGrant,
    subscription: EventSubscription,
) -> TermhubResult<()> {
    let mut events = subscription.events;
    send_message(ws, &ServerMessage::Init(subscription.sessions)).await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => send_message(ws, &event).await?,
                None => {
                    // Dropped by the registry for falling behind.
                    close_with(ws, CLOSE_NORMAL, "event stream ended").await;
                    break;
                }
            },

            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = handle_control(&text, registry, auth, grant).await {
                        send_message(ws, &reply).await?;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "events recv failed");
                    break;
                }
            },
        }
    }

    Ok(())
}

/// Serve one management request. Returns the direct reply, if any.
///
/// `create` and `kill` also produce registry events, which reach every
/// events channel including this one.
async fn handle_control(
    text: &str,
    registry: &SessionRegistry,
    auth: &Authenticator,
    grant: AuthGrant,
) -> Option<ServerMessage> {
    let request: ControlMessage = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "malformed control message");
            return Some(error_reply(format!("invalid message: {e}")));
        }
    };

    match request {
        ControlMessage::Create { cwd } => match registry.create_session(cwd.as_deref()).await {
            Ok(id) => Some(ServerMessage::Created(SessionRef { id })),
            Err(e) => Some(error_reply(e.to_string())),
        },
        ControlMessage::Kill { id } => {
            registry.kill_session(&id).await;
            None
        }
        ControlMessage::List => Some(ServerMessage::Sessions(registry.list_sessions().await)),
        ControlMessage::SessionKey => match auth.issue_key(grant) {
            Ok(key) => Some(ServerMessage::Key(KeyGrant { key })),
            Err(e) => {
                warn!(?grant, "session key request refused");
                Some(error_reply(e.to_string()))
            }
        },
        ControlMessage::Unknown => None,
    }
}

fn error_reply(message: String) -> ServerMessage {
    ServerMessage::Error(ErrorBody { message })
}
