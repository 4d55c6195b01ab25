/*
[INPUT]:  Raw tr_json2 text frames; login identity, item and post settings
[OUTPUT]: Decoded InboundMessage variants and outbound JSON messages
[POS]:    WebSocket layer - wire format
[UPDATE]: When handling new message kinds or changing request shapes
*/

use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::auth::Credential;

/// Stream ID of the login stream
pub const LOGIN_STREAM_ID: i64 = 1;

/// Stream ID of the configured item request
pub const ITEM_STREAM_ID: i64 = 2;

/// `State` object carried by refresh and status messages
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamState {
    #[serde(rename = "Stream", default)]
    pub stream: Option<String>,
    #[serde(rename = "Data", default)]
    pub data: Option<String>,
    #[serde(rename = "Text", default)]
    pub text: Option<String>,
}

impl StreamState {
    pub fn is_stream_open(&self) -> bool {
        self.stream.as_deref().is_none_or(|stream| stream == "Open")
    }

    pub fn is_data_ok(&self) -> bool {
        self.data.as_deref() == Some("Ok")
    }

    pub fn is_open_ok(&self) -> bool {
        self.is_stream_open() && self.is_data_ok()
    }
}

/// One decoded message from a gateway frame
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    LoginRefresh { state: Option<StreamState> },
    LoginStatus { state: Option<StreamState> },
    ItemRefresh { id: i64, domain: Option<String>, state: Option<StreamState> },
    Status { id: i64, domain: Option<String>, state: Option<StreamState> },
    Ping,
    Ack { id: i64, ack_id: Option<i64>, nak_code: Option<String>, text: Option<String> },
    /// Updates, errors and anything not handled by the session
    Other(Value),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "Type", default)]
    kind: Option<String>,
    #[serde(rename = "ID", default)]
    id: Option<i64>,
    #[serde(rename = "Domain", default)]
    domain: Option<String>,
    #[serde(rename = "State", default)]
    state: Option<StreamState>,
    #[serde(rename = "AckID", default)]
    ack_id: Option<i64>,
    #[serde(rename = "NakCode", default)]
    nak_code: Option<String>,
    #[serde(rename = "Text", default)]
    text: Option<String>,
}

impl InboundMessage {
    /// Classify one JSON message object.
    pub fn from_value(value: Value) -> Self {
        let Ok(envelope) = Envelope::deserialize(&value) else {
            return InboundMessage::Other(value);
        };
        let is_login = envelope.domain.as_deref() == Some("Login");
        let id = envelope.id.unwrap_or_default();

        match envelope.kind.as_deref() {
            Some("Ping") => InboundMessage::Ping,
            Some("Refresh") if is_login => InboundMessage::LoginRefresh {
                state: envelope.state,
            },
            Some("Status") if is_login => InboundMessage::LoginStatus {
                state: envelope.state,
            },
            Some("Refresh") => InboundMessage::ItemRefresh {
                id,
                domain: envelope.domain,
                state: envelope.state,
            },
            Some("Status") => InboundMessage::Status {
                id,
                domain: envelope.domain,
                state: envelope.state,
            },
            Some("Ack") => InboundMessage::Ack {
                id,
                ack_id: envelope.ack_id,
                nak_code: envelope.nak_code,
                text: envelope.text,
            },
            _ => InboundMessage::Other(value),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::LoginRefresh { .. } => "login_refresh",
            InboundMessage::LoginStatus { .. } => "login_status",
            InboundMessage::ItemRefresh { .. } => "refresh",
            InboundMessage::Status { .. } => "status",
            InboundMessage::Ping => "ping",
            InboundMessage::Ack { .. } => "ack",
            InboundMessage::Other(_) => "other",
        }
    }
}

/// Decode a text frame. Frames are JSON arrays of messages; a bare object is
/// accepted as a one-message frame.
pub fn parse_frame(text: &str) -> Result<Vec<InboundMessage>, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    Ok(match value {
        Value::Array(items) => items.into_iter().map(InboundMessage::from_value).collect(),
        other => vec![InboundMessage::from_value(other)],
    })
}

/// Who the login request speaks for
#[derive(Debug, Clone)]
pub enum LoginIdentity {
    /// OAuth access token
    Token(Arc<Credential>),
    /// Plain user name for deployments without token authentication
    User(String),
}

impl LoginIdentity {
    pub fn user(name: impl Into<String>) -> Self {
        LoginIdentity::User(name.into())
    }
}

/// Login request on stream 1. A re-login is flagged with `"Refresh": false`
/// so the server does not answer with a full refresh.
pub fn login_request(identity: &LoginIdentity, app_id: &str, position: &str, relogin: bool) -> Value {
    let mut login = match identity {
        LoginIdentity::Token(credential) => json!({
            "ID": LOGIN_STREAM_ID,
            "Domain": "Login",
            "Key": {
                "NameType": "AuthnToken",
                "Elements": {
                    "ApplicationId": app_id,
                    "Position": position,
                    "AuthenticationToken": credential.access_token,
                }
            }
        }),
        LoginIdentity::User(name) => json!({
            "ID": LOGIN_STREAM_ID,
            "Domain": "Login",
            "Key": {
                "Name": name,
                "Elements": {
                    "ApplicationId": app_id,
                    "Position": position,
                }
            }
        }),
    };
    if relogin && let Some(object) = login.as_object_mut() {
        object.insert("Refresh".to_string(), Value::Bool(false));
    }
    login
}

/// Protocol-level pong
pub fn pong() -> Value {
    json!({ "Type": "Pong" })
}

/// The market-data request a session issues once logged in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRequest {
    pub names: Vec<String>,
    pub service: Option<String>,
    pub view: Vec<String>,
}

impl ItemRequest {
    pub fn single(name: impl Into<String>) -> Self {
        Self {
            names: vec![name.into()],
            service: None,
            view: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Value {
        let name = match self.names.as_slice() {
            [single] => Value::String(single.clone()),
            many => Value::Array(many.iter().cloned().map(Value::String).collect()),
        };
        let mut key = json!({ "Name": name });
        if let Some(service) = &self.service {
            key["Service"] = Value::String(service.clone());
        }

        let mut request = json!({ "ID": ITEM_STREAM_ID, "Key": key });
        if !self.view.is_empty() {
            request["View"] = Value::Array(self.view.iter().cloned().map(Value::String).collect());
        }
        request
    }
}

/// Post message on the item stream
pub fn post_message(post_id: u64, address: &str, user_id: u32, fields: &Value) -> Value {
    json!({
        "ID": ITEM_STREAM_ID,
        "Type": "Post",
        "Domain": "MarketPrice",
        "Ack": true,
        "PostID": post_id,
        "PostUserInfo": {
            "Address": address,
            "UserID": user_id,
        },
        "Message": {
            "ID": 0,
            "Type": "Update",
            "Domain": "MarketPrice",
            "Fields": fields,
        }
    })
}

/// A decoded message tagged with the session it arrived on
#[derive(Debug, Clone)]
pub struct SessionFrame {
    pub session_id: Arc<str>,
    pub message: InboundMessage,
}
