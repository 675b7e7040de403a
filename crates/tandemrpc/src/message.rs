//! # Message Envelope
//!
//! The wire shapes exchanged over the channel and the predicates that tell
//! them apart. Messages arrive already decoded into `serde_json::Value`; this
//! module never touches bytes.
//!
//! ## Classification
//!
//! Classification looks only at which keys are present, in a fixed order:
//!
//! | keys present                  | shape          |
//! |-------------------------------|----------------|
//! | `result`, `error`, `id`       | Response       |
//! | `method`, `params`, `id`      | Request        |
//! | `method`, `params`            | Notification   |
//! | `method = "set_protocol"`, `data` | SetProtocol |
//! | anything else                 | Unparseable    |
//!
//! Because the rules are evaluated in order, a message has exactly one shape.

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_json::json;

use crate::error::ErrorPayload;
use crate::error::RpcError;
use crate::protocol::Protocol;

/// The version tag carried by calls.
pub const VERSION: &str = "2.0";

/// The method name of the capability exchange message.
pub const SET_PROTOCOL: &str = "set_protocol";

fn default_version() -> String {
    VERSION.to_string()
}

fn default_required() -> bool {
    true
}

/// One keyed argument of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub key: String,
    pub value: Value,
    #[serde(default = "default_required")]
    pub required: bool,
}

impl Param {
    pub fn required(key: impl Into<String>, value: Value) -> Self {
        Self { key: key.into(), value, required: true }
    }

    pub fn optional(key: impl Into<String>, value: Value) -> Self {
        Self { key: key.into(), value, required: false }
    }
}

/// A call that expects a correlated Response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub params: Vec<Param>,
    pub id: String,
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    /// Structured routing address; `None` targets the peer's default object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Vec<Param>, id: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params,
            id: id.into(),
            jsonrpc: default_version(),
            object: None,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut value = json!({
            "method": self.method,
            "params": self.params,
            "id": self.id,
            "jsonrpc": self.jsonrpc,
        });
        if let Some(object) = &self.object {
            value["object"] = Value::String(object.clone());
        }
        value
    }
}

/// A one-way call. Carries no id; nothing is ever sent back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    pub params: Vec<Param>,
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            method: method.into(),
            params,
            jsonrpc: default_version(),
            object: None,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut value = json!({
            "method": self.method,
            "params": self.params,
            "jsonrpc": self.jsonrpc,
        });
        if let Some(object) = &self.object {
            value["object"] = Value::String(object.clone());
        }
        value
    }
}

/// The reply to a Request, correlated by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub result: Value,
    pub error: Option<ErrorPayload>,
    pub id: String,
}

impl Response {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self { result, error: None, id: id.into() }
    }

    pub fn failure(id: impl Into<String>, error: &RpcError) -> Self {
        Self {
            result: Value::Null,
            error: Some(error.to_payload()),
            id: id.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn to_value(&self) -> Value {
        json!({
            "result": self.result,
            "error": self.error,
            "id": self.id,
        })
    }
}

/// Capability exchange: announces the sender's protocol to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetProtocol {
    pub method: String,
    pub data: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
}

impl SetProtocol {
    pub fn new(data: Protocol) -> Self {
        Self {
            method: SET_PROTOCOL.to_string(),
            data,
            object: None,
        }
    }

    pub fn for_object(object: impl Into<String>, data: Protocol) -> Self {
        Self {
            object: Some(object.into()),
            ..Self::new(data)
        }
    }

    pub fn to_value(&self) -> Value {
        let mut value = json!({
            "method": self.method,
            "data": self.data,
        });
        if let Some(object) = &self.object {
            value["object"] = Value::String(object.clone());
        }
        value
    }
}

/// The shape of an inbound message, decided from its keys alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Response,
    Request,
    Notification,
    SetProtocol,
    Unparseable,
}

pub fn shape(message: &Value) -> Shape {
    let Some(obj) = message.as_object() else {
        return Shape::Unparseable;
    };
    let has = |key: &str| obj.contains_key(key);

    if has("result") && has("error") && has("id") {
        Shape::Response
    } else if has("method") && has("params") && has("id") {
        Shape::Request
    } else if has("method") && has("params") {
        Shape::Notification
    } else if has("data") && obj.get("method").and_then(Value::as_str) == Some(SET_PROTOCOL) {
        Shape::SetProtocol
    } else {
        Shape::Unparseable
    }
}

pub fn is_response(message: &Value) -> bool {
    shape(message) == Shape::Response
}

pub fn is_request(message: &Value) -> bool {
    shape(message) == Shape::Request
}

pub fn is_notification(message: &Value) -> bool {
    shape(message) == Shape::Notification
}

/// A fully parsed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Response(Response),
    Request(Request),
    Notification(Notification),
    SetProtocol(SetProtocol),
}

/// A message that could not be classified or parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Malformed {
    pub error: RpcError,
    /// The message id, when one can still be read, so the sender can be told.
    pub id: Option<String>,
}

/// Classifies a message by shape and parses it into its typed form.
///
/// Messages that match no shape are `ParseError`s, unless they carry a
/// `method` or `params` key, in which case they superficially resemble a call
/// and are `InvalidRequest`s. A message that has a shape but fails to parse is
/// an `InvalidRequest`; for requests the id is recovered when possible.
pub fn classify(message: &Value) -> Result<Message, Malformed> {
    match shape(message) {
        Shape::Response => parse(message, "response")
            .map(Message::Response)
            .map_err(|error| Malformed { error, id: None }),
        Shape::Request => parse(message, "request")
            .map(Message::Request)
            .map_err(|error| Malformed { error, id: string_id(message) }),
        Shape::Notification => parse(message, "notification")
            .map(Message::Notification)
            .map_err(|error| Malformed { error, id: None }),
        Shape::SetProtocol => parse(message, "protocol announcement")
            .map(Message::SetProtocol)
            .map_err(|error| Malformed { error, id: None }),
        Shape::Unparseable => Err(unparseable(message)),
    }
}

fn parse<T: DeserializeOwned>(message: &Value, what: &str) -> Result<T, RpcError> {
    T::deserialize(message)
        .map_err(|e| RpcError::invalid_request(format!("malformed {what}: {e}")))
}

fn string_id(message: &Value) -> Option<String> {
    message.get("id").and_then(Value::as_str).map(str::to_string)
}

fn unparseable(message: &Value) -> Malformed {
    let resembles_call = message
        .as_object()
        .is_some_and(|obj| obj.contains_key("method") || obj.contains_key("params"));

    if resembles_call {
        Malformed {
            error: RpcError::invalid_request("a call needs both 'method' and 'params'"),
            id: string_id(message),
        }
    } else {
        Malformed {
            error: RpcError::parse_error(format!("could not parse message: {message}")),
            id: None,
        }
    }
}
