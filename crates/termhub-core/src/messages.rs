//! JSON wire messages for the terminal and events channels.
//!
//! Every frame is a single JSON text message carrying a `"type"` tag.
//! Outbound messages put their payload under `"data"`.

use crate::error::{TermhubError, TermhubResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default terminal width used when a client omits or garbles geometry.
pub const DEFAULT_COLS: u16 = 80;
/// Default terminal height used when a client omits or garbles geometry.
pub const DEFAULT_ROWS: u16 = 24;

/// Close code sent when a connection presents no valid credential.
pub const CLOSE_AUTH_FAILED: u16 = 4003;
/// Close code sent when the addressed session does not exist.
pub const CLOSE_SESSION_NOT_FOUND: u16 = 4004;

/// Inbound message on a terminal channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Raw keystrokes, forwarded verbatim to the shell.
    Input(String),
    /// New terminal geometry.
    Resize { cols: u16, rows: u16 },
}

impl ClientMessage {
    /// Parse a text frame.
    ///
    /// Returns `Ok(None)` for well-formed messages of a kind this server does
    /// not know, so newer clients can talk to older servers.
    pub fn parse(text: &str) -> TermhubResult<Option<Self>> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| TermhubError::InvalidMessage("missing \"type\" field".into()))?;

        match kind {
            "input" => {
                let data = value
                    .get("data")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        TermhubError::InvalidMessage("input without string \"data\"".into())
                    })?;
                Ok(Some(ClientMessage::Input(data.to_string())))
            }
            "resize" => Ok(Some(ClientMessage::Resize {
                cols: dimension(&value, "cols").unwrap_or(DEFAULT_COLS),
                rows: dimension(&value, "rows").unwrap_or(DEFAULT_ROWS),
            })),
            _ => Ok(None),
        }
    }
}

/// A positive dimension that fits a `u16`, or `None`.
fn dimension(value: &Value, field: &str) -> Option<u16> {
    value
        .get(field)
        .and_then(Value::as_u64)
        .filter(|n| *n > 0)
        .and_then(|n| u16::try_from(n).ok())
}

/// Inbound message on the events channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Spawn a new session, optionally in a working directory.
    Create {
        #[serde(default)]
        cwd: Option<String>,
    },
    /// Kill a session by id.
    Kill { id: String },
    /// Ask for the current session list.
    List,
    /// Ask for a short-lived session key.
    SessionKey,
    #[serde(other)]
    Unknown,
}

/// Outbound message on either channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// One chunk of shell output.
    Output(String),
    /// A session was created.
    Create(SessionCreated),
    /// A session was killed or reaped.
    Kill(SessionRef),
    /// Session list sent once when an events channel attaches.
    Init(Vec<SessionSummary>),
    /// Reply to a `create` control message.
    Created(SessionRef),
    /// Reply to a `list` control message.
    Sessions(Vec<SessionSummary>),
    /// Reply to a `session_key` control message.
    Key(KeyGrant),
    /// A control request could not be served.
    Error(ErrorBody),
}

impl ServerMessage {
    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> TermhubResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Payload of a `create` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCreated {
    pub id: String,
    pub cwd: Option<String>,
}

/// A bare session id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRef {
    pub id: String,
}

/// One entry of a session listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    /// Unix timestamp in seconds.
    pub created_at: f64,
    pub cwd: Option<String>,
    pub closed: bool,
}

/// A freshly issued session key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyGrant {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_input() {
        let msg = ClientMessage::parse(r#"{"type":"input","data":"ls -la\n"}"#).unwrap();
        assert_eq!(msg, Some(ClientMessage::Input("ls -la\n".into())));
    }

    #[test]
    fn parse_resize() {
        let msg = ClientMessage::parse(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(msg, Some(ClientMessage::Resize { cols: 120, rows: 40 }));
    }

    #[test]
    fn resize_defaults_missing_or_invalid_dimensions() {
        let msg = ClientMessage::parse(r#"{"type":"resize"}"#).unwrap();
        assert_eq!(msg, Some(ClientMessage::Resize { cols: 80, rows: 24 }));

        let msg = ClientMessage::parse(r#"{"type":"resize","cols":"wide","rows":-3}"#).unwrap();
        assert_eq!(msg, Some(ClientMessage::Resize { cols: 80, rows: 24 }));

        let msg = ClientMessage::parse(r#"{"type":"resize","cols":0,"rows":70000}"#).unwrap();
        assert_eq!(msg, Some(ClientMessage::Resize { cols: 80, rows: 24 }));
    }

    #[test]
    fn unknown_kind_is_ignored() {
        let msg = ClientMessage::parse(r#"{"type":"paste","data":"x"}"#).unwrap();
        assert_eq!(msg, None);
    }

    #[test]
    fn malformed_frames_are_errors() {
        assert!(ClientMessage::parse("not json").is_err());
        assert!(ClientMessage::parse(r#"{"data":"x"}"#).is_err());
        assert!(ClientMessage::parse(r#"{"type":"input","data":42}"#).is_err());
    }

    #[test]
    fn output_wire_shape() {
        let json = ServerMessage::Output("hi\r\n".into()).to_json().unwrap();
        assert_eq!(json, r#"{"type":"output","data":"hi\r\n"}"#);
    }

    #[test]
    fn event_wire_shapes() {
        let create = ServerMessage::Create(SessionCreated {
            id: "abc".into(),
            cwd: None,
        });
        assert_eq!(
            create.to_json().unwrap(),
            r#"{"type":"create","data":{"id":"abc","cwd":null}}"#
        );

        let kill = ServerMessage::Kill(SessionRef { id: "abc".into() });
        assert_eq!(kill.to_json().unwrap(), r#"{"type":"kill","data":{"id":"abc"}}"#);

        let init = ServerMessage::Init(vec![]);
        assert_eq!(init.to_json().unwrap(), r#"{"type":"init","data":[]}"#);
    }

    #[test]
    fn control_messages() {
        let msg: ControlMessage = serde_json::from_str(r#"{"type":"create"}"#).unwrap();
        assert_eq!(msg, ControlMessage::Create { cwd: None });

        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"create","cwd":"/tmp"}"#).unwrap();
        assert_eq!(msg, ControlMessage::Create { cwd: Some("/tmp".into()) });

        let msg: ControlMessage = serde_json::from_str(r#"{"type":"kill","id":"s1"}"#).unwrap();
        assert_eq!(msg, ControlMessage::Kill { id: "s1".into() });

        let msg: ControlMessage = serde_json::from_str(r#"{"type":"rename"}"#).unwrap();
        assert_eq!(msg, ControlMessage::Unknown);
    }
}
