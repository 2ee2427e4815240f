//! Session endpoint: one observer of one terminal session.

use super::{credentials, CLOSE_NORMAL};
use crate::auth::Authenticator;
use crate::session::{Attachment, SessionRegistry, TerminalSession};
use crate::transport::websocket::{close_with, send_message};
use crate::transport::{WebSocketConnection, WsStream};
use futures_util::{SinkExt, StreamExt};
use termhub_core::{
    ClientMessage, ServerMessage, TermhubResult, CLOSE_AUTH_FAILED, CLOSE_SESSION_NOT_FOUND,
};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Serve a `/terminal/{id}` connection until either side goes away.
pub async fn serve(
    mut conn: WebSocketConnection,
    session_id: &str,
    registry: &SessionRegistry,
    auth: &Authenticator,
) {
    let remote = conn.remote_addr;

    let grant = match auth.authenticate(&credentials(&conn.request)) {
        Ok(grant) => grant,
        Err(e) => {
            warn!(remote = %remote, session_id, error = %e, "terminal connection refused");
            close_with(&mut conn.ws_stream, CLOSE_AUTH_FAILED, "authentication failed").await;
            return;
        }
    };

    let session = match registry.require_session(session_id).await {
        Ok(session) => session,
        Err(e) => {
            warn!(remote = %remote, error = %e, "terminal connection refused");
            close_with(&mut conn.ws_stream, CLOSE_SESSION_NOT_FOUND, "session not found").await;
            return;
        }
    };

    let attachment = session.attach();
    let observer_id = attachment.observer_id;
    info!(remote = %remote, session_id, ?grant, observer = observer_id, "terminal attached");

    let command = conn.request.param("command").map(str::to_string);
    if let Err(e) = relay(&mut conn.ws_stream, &session, attachment, command.as_deref()).await {
        debug!(remote = %remote, session_id, error = %e, "terminal connection ended with error");
    }

    // Leaving never closes the session.
    session.detach(observer_id);
    info!(remote = %remote, session_id, observer = observer_id, "terminal detached");
}

async fn relay(
    ws: &mut WsStream,
    session: &TerminalSession,
    attachment: Attachment,
    command: Option<&str>,
) -> TermhubResult<()> {
    let Attachment {
        history,
        mut output,
        ..
    } = attachment;

    for chunk in history {
        send_message(ws, &ServerMessage::Output(chunk)).await?;
    }
    if let Some(command) = command {
        debug!(session_id = session.id(), "injecting initial command");
        session.write_input(&format!("{command}\r\n"));
    }

    loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Some(text) => send_message(ws, &ServerMessage::Output(text)).await?,
                None => {
                    // Session closed, or this observer fell behind and was
                    // dropped. Either way there is nothing more to send.
                    close_with(ws, CLOSE_NORMAL, "session closed").await;
                    break;
                }
            },

            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => apply(session, &text),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(session_id = session.id(), "terminal peer closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session_id = session.id(), error = %e, "terminal recv failed");
                    break;
                }
            },
        }
    }

    Ok(())
}

/// Apply one inbound text frame to the session.
fn apply(session: &TerminalSession, text: &str) {
    match ClientMessage::parse(text) {
        Ok(Some(ClientMessage::Input(data))) => session.write_input(&data),
        Ok(Some(ClientMessage::Resize { cols, rows })) => session.resize(cols, rows),
        Ok(None) => {}
        Err(e) => debug!(session_id = session.id(), error = %e, "ignoring malformed frame"),
    }
}
