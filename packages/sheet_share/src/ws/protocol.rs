//! WebSocket Protocol Types
//!
//! Envelopes exchanged over the share socket. Every frame is one JSON object
//! tagged with `type` (the parser also accepts `kind`).

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Name used for `sharedBy` when the sender never registered and sent no username.
pub const ANONYMOUS_SHARER: &str = "anonymous";

/// Messages sent FROM the client TO the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Claim a display identity for this connection
    RegisterUser { username: String },
    /// Share a character payload with every other connected peer
    ShareCharacter {
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
}

/// Presence change direction carried by `user-status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Join,
    Leave,
}

/// Messages sent FROM the server TO the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First message on every connection
    ConnectionEstablished { message: String },
    /// Presence snapshot: de-duplicated, sorted identities
    OnlineUsers { users: Vec<String> },
    /// Presence change for a single identity
    UserStatus {
        action: PresenceAction,
        username: String,
    },
    RegisterConfirmed { message: String },
    /// Fan-out of another peer's share
    SharedCharacter {
        content: Value,
        #[serde(rename = "sharedBy")]
        shared_by: String,
    },
    ShareConfirmed { message: String, delivered: usize },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
}

impl ServerMessage {
    pub fn connection_established() -> Self {
        ServerMessage::ConnectionEstablished {
            message: "Connected to character share server".to_string(),
        }
    }

    pub fn register_confirmed(username: &str) -> Self {
        ServerMessage::RegisterConfirmed {
            message: format!("Registered as {username}"),
        }
    }

    pub fn share_confirmed(delivered: usize) -> Self {
        let noun = if delivered == 1 { "user" } else { "users" };
        ServerMessage::ShareConfirmed {
            message: format!("Character shared with {delivered} {noun}"),
            delivered,
        }
    }

    /// Wire name of this message's `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::ConnectionEstablished { .. } => "connection-established",
            ServerMessage::OnlineUsers { .. } => "online-users",
            ServerMessage::UserStatus { .. } => "user-status",
            ServerMessage::RegisterConfirmed { .. } => "register-confirmed",
            ServerMessage::SharedCharacter { .. } => "shared-character",
            ServerMessage::ShareConfirmed { .. } => "share-confirmed",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// Kinds a client may send. Anything else is rejected before deserialization.
const CLIENT_KINDS: &[&str] = &["register-user", "share-character"];

/// Protocol violations detected while parsing an inbound frame.
///
/// None of these mutate server state; each becomes one `error` reply to the
/// sender via [`ProtocolError::to_server_message`].
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid message format")]
    Malformed(#[source] serde_json::Error),

    #[error("Message must be a JSON object")]
    NotAnObject,

    #[error("Message is missing a string `type` field")]
    MissingKind,

    #[error("Unknown message type: {0}")]
    UnknownKind(String),

    #[error("Invalid {kind} message")]
    InvalidShape {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid {kind} message: {field} {reason}")]
    InvalidField {
        kind: &'static str,
        field: &'static str,
        reason: &'static str,
    },
}

impl ProtocolError {
    /// Structured description of the violation, sent as the `detail` field.
    pub fn detail(&self) -> Value {
        match self {
            ProtocolError::Malformed(e) => json!({
                "reason": "unparseable JSON",
                "line": e.line(),
                "column": e.column(),
            }),
            ProtocolError::NotAnObject => json!({ "reason": "expected a JSON object" }),
            ProtocolError::MissingKind => json!({
                "field": "type",
                "reason": "missing or not a string",
            }),
            ProtocolError::UnknownKind(kind) => json!({
                "kind": kind,
                "reason": "unknown message type",
                "expected": CLIENT_KINDS,
            }),
            ProtocolError::InvalidShape { kind, source } => json!({
                "kind": kind,
                "reason": source.to_string(),
            }),
            ProtocolError::InvalidField {
                kind,
                field,
                reason,
            } => json!({
                "kind": kind,
                "field": field,
                "reason": reason,
            }),
        }
    }

    pub fn to_server_message(&self) -> ServerMessage {
        ServerMessage::Error {
            message: self.to_string(),
            detail: Some(self.detail()),
        }
    }
}

/// Parse and validate one inbound text frame.
///
/// Stages: JSON parse, discriminator lookup (`type`, falling back to `kind`),
/// serde shape check for the declared kind, then field-level rules serde
/// cannot express.
pub fn parse_client_frame(text: &str) -> Result<ClientMessage, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    let kind = match object.get("type").or_else(|| object.get("kind")) {
        Some(Value::String(kind)) => kind.clone(),
        _ => return Err(ProtocolError::MissingKind),
    };
    if !CLIENT_KINDS.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownKind(kind));
    }

    // Normalize the discriminator so serde sees a single `type` tag.
    object.remove("kind");
    object.insert("type".to_string(), Value::String(kind.clone()));

    let msg: ClientMessage = serde_json::from_value(Value::Object(object))
        .map_err(|source| ProtocolError::InvalidShape { kind, source })?;

    validate(msg)
}

fn validate(msg: ClientMessage) -> Result<ClientMessage, ProtocolError> {
    match msg {
        ClientMessage::RegisterUser { username } => {
            let username = username.trim();
            if username.is_empty() {
                return Err(ProtocolError::InvalidField {
                    kind: "register-user",
                    field: "username",
                    reason: "must not be empty",
                });
            }
            Ok(ClientMessage::RegisterUser {
                username: username.to_string(),
            })
        }
        ClientMessage::ShareCharacter { content, username } => {
            if content.is_null() {
                return Err(ProtocolError::InvalidField {
                    kind: "share-character",
                    field: "content",
                    reason: "must not be null",
                });
            }
            let username = username
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty());
            Ok(ClientMessage::ShareCharacter { content, username })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_register_user() {
        let msg = parse_client_frame(r#"{"type":"register-user","username":"nova"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::RegisterUser {
                username: "nova".into()
            }
        );
    }

    #[test]
    fn parse_accepts_kind_discriminator() {
        let msg = parse_client_frame(r#"{"kind":"register-user","username":"zed"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::RegisterUser {
                username: "zed".into()
            }
        );
    }

    #[test]
    fn parse_trims_username() {
        let msg = parse_client_frame(r#"{"type":"register-user","username":"  nova "}"#).unwrap();
        match msg {
            ClientMessage::RegisterUser { username } => assert_eq!(username, "nova"),
            other => panic!("Expected RegisterUser, got {:?}", other),
        }
    }

    #[test]
    fn parse_rejects_empty_username() {
        let err = parse_client_frame(r#"{"type":"register-user","username":"   "}"#).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidField {
                field: "username",
                ..
            }
        ));
        let detail = err.detail();
        assert_eq!(detail["field"], "username");
        assert_eq!(detail["kind"], "register-user");
    }

    #[test]
    fn parse_rejects_missing_username() {
        let err = parse_client_frame(r#"{"type":"register-user"}"#).unwrap_err();
        match err {
            ProtocolError::InvalidShape { ref kind, .. } => assert_eq!(kind, "register-user"),
            other => panic!("Expected InvalidShape, got {:?}", other),
        }
        assert!(err.detail()["reason"].as_str().unwrap().contains("username"));
    }

    #[test]
    fn parse_rejects_non_string_username() {
        let err = parse_client_frame(r#"{"type":"register-user","username":42}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidShape { .. }));
    }

    #[test]
    fn parse_share_character_without_username() {
        let msg =
            parse_client_frame(r#"{"type":"share-character","content":{"name":"Rex"}}"#).unwrap();
        match msg {
            ClientMessage::ShareCharacter { content, username } => {
                assert_eq!(content["name"], "Rex");
                assert!(username.is_none());
            }
            other => panic!("Expected ShareCharacter, got {:?}", other),
        }
    }

    #[test]
    fn parse_share_character_blank_username_is_dropped() {
        let msg = parse_client_frame(
            r#"{"type":"share-character","content":{"name":"Rex"},"username":" "}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::ShareCharacter { username, .. } => assert!(username.is_none()),
            other => panic!("Expected ShareCharacter, got {:?}", other),
        }
    }

    #[test]
    fn parse_share_character_requires_content() {
        let err = parse_client_frame(r#"{"type":"share-character","username":"nova"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidShape { .. }));

        let err = parse_client_frame(r#"{"type":"share-character","content":null}"#).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidField {
                field: "content",
                ..
            }
        ));
    }

    #[test]
    fn parse_malformed_json() {
        let err = parse_client_frame("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        match err.to_server_message() {
            ServerMessage::Error { message, detail } => {
                assert_eq!(message, "Invalid message format");
                assert!(detail.is_some());
            }
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[test]
    fn parse_non_object() {
        assert!(matches!(
            parse_client_frame("[1,2,3]").unwrap_err(),
            ProtocolError::NotAnObject
        ));
        assert!(matches!(
            parse_client_frame("\"register-user\"").unwrap_err(),
            ProtocolError::NotAnObject
        ));
    }

    #[test]
    fn parse_missing_or_non_string_kind() {
        assert!(matches!(
            parse_client_frame(r#"{"username":"nova"}"#).unwrap_err(),
            ProtocolError::MissingKind
        ));
        assert!(matches!(
            parse_client_frame(r#"{"type":7}"#).unwrap_err(),
            ProtocolError::MissingKind
        ));
    }

    #[test]
    fn parse_unknown_kind() {
        let err = parse_client_frame(r#"{"type":"delete-everything"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Unknown message type: delete-everything");
    }

    #[test]
    fn parse_rejects_server_only_kinds() {
        let err = parse_client_frame(r#"{"type":"online-users","users":["x"]}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind(k) if k == "online-users"));
    }

    #[test]
    fn server_message_wire_shape() {
        let json = serde_json::to_value(ServerMessage::UserStatus {
            action: PresenceAction::Leave,
            username: "nova".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "user-status");
        assert_eq!(json["action"], "leave");
        assert_eq!(json["username"], "nova");

        let json = serde_json::to_value(ServerMessage::SharedCharacter {
            content: json!({"name": "Rex"}),
            shared_by: "nova".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "shared-character");
        assert_eq!(json["sharedBy"], "nova");
        assert_eq!(json["content"]["name"], "Rex");

        let json = serde_json::to_value(ServerMessage::OnlineUsers {
            users: vec!["nova".into(), "zed".into()],
        })
        .unwrap();
        assert_eq!(json, json!({"type": "online-users", "users": ["nova", "zed"]}));
    }

    #[test]
    fn error_without_detail_omits_field() {
        let json = serde_json::to_value(ServerMessage::Error {
            message: "boom".into(),
            detail: None,
        })
        .unwrap();
        assert!(json.get("detail").is_none());
    }

    #[test]
    fn share_confirmed_reports_count() {
        match ServerMessage::share_confirmed(1) {
            ServerMessage::ShareConfirmed { message, delivered } => {
                assert_eq!(delivered, 1);
                assert!(message.contains("1 user"));
            }
            other => panic!("Expected ShareConfirmed, got {:?}", other),
        }
        match ServerMessage::share_confirmed(3) {
            ServerMessage::ShareConfirmed { message, .. } => assert!(message.contains("3 users")),
            other => panic!("Expected ShareConfirmed, got {:?}", other),
        }
    }

    #[test]
    fn kind_matches_serialized_tag() {
        let msgs = [
            ServerMessage::connection_established(),
            ServerMessage::OnlineUsers { users: vec![] },
            ServerMessage::register_confirmed("nova"),
            ServerMessage::share_confirmed(0),
        ];
        for msg in msgs {
            let json = serde_json::to_value(&msg).unwrap();
            assert_eq!(json["type"], msg.kind());
        }
    }
}
