//! # Error Taxonomy
//!
//! The coded failure kinds that travel across the channel inside a Response.
//!
//! Codes follow the JSON-RPC 2.0 reservations so either end can map a payload
//! back to a kind without sharing anything beyond this table.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// A named, coded class of protocol failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The inbound message matches no known message shape.
    ParseError,
    /// The message looks like a call but is malformed.
    InvalidRequest,
    /// The method does not resolve to a procedure on the target.
    MethodNotFound,
    /// A required parameter is missing, or a parameter key is unknown.
    InvalidParams,
    /// The local handler failed in an unexpected way (e.g. it panicked).
    InternalError,
    /// Catch-all for handler failures outside the rest of the taxonomy.
    ServerError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::ParseError,
        ErrorKind::InvalidRequest,
        ErrorKind::MethodNotFound,
        ErrorKind::InvalidParams,
        ErrorKind::InternalError,
        ErrorKind::ServerError,
    ];

    pub fn code(self) -> i64 {
        match self {
            Self::ParseError     => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams  => -32602,
            Self::InternalError  => -32603,
            Self::ServerError    => -32000,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ParseError     => "ParseError",
            Self::InvalidRequest => "InvalidRequest",
            Self::MethodNotFound => "MethodNotFound",
            Self::InvalidParams  => "InvalidParams",
            Self::InternalError  => "InternalError",
            Self::ServerError    => "ServerError",
        }
    }

    /// The message used when a failure is raised without one.
    pub fn default_message(self) -> &'static str {
        match self {
            Self::ParseError     => "Parse Error.",
            Self::InvalidRequest => "Invalid Request.",
            Self::MethodNotFound => "Method not found.",
            Self::InvalidParams  => "Invalid params.",
            Self::InternalError  => "Internal Error.",
            Self::ServerError    => "Server Error.",
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The `error` member of a Response.
///
/// Decoding never fails: peers that send only `{code, message}`, or a bare
/// value, still produce a payload. Missing members are filled from the code's
/// [`ErrorKind`], falling back to `ServerError`, and a non-object error is
/// kept whole in `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value")]
pub struct ErrorPayload {
    pub name: String,
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl From<Value> for ErrorPayload {
    fn from(value: Value) -> Self {
        let mut fields = match value {
            Value::Object(fields) => fields,
            other => {
                let message = match &other {
                    Value::String(message) => message.clone(),
                    _ => ErrorKind::ServerError.default_message().to_string(),
                };
                return Self {
                    name: ErrorKind::ServerError.name().to_string(),
                    code: ErrorKind::ServerError.code(),
                    message,
                    data: Some(other),
                };
            }
        };

        let code = fields.get("code").and_then(Value::as_i64).unwrap_or(ErrorKind::ServerError.code());
        let kind = ErrorKind::from_code(code);
        let name = match fields.get("name").and_then(Value::as_str) {
            Some(name) => name.to_string(),
            None => kind.map_or("Error", ErrorKind::name).to_string(),
        };
        let message = match fields.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => kind.map_or("", ErrorKind::default_message).to_string(),
        };
        let data = fields.remove("data").filter(|data| !data.is_null());

        Self { name, code, message, data }
    }
}

impl ErrorPayload {
    /// The taxonomy member this payload's code belongs to, if any.
    pub fn kind(&self) -> Option<ErrorKind> {
        ErrorKind::from_code(self.code)
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// A taxonomy failure raised locally, before it is flattened into an [`ErrorPayload`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RpcError {
    kind: ErrorKind,
    message: String,
    data: Option<Value>,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MethodNotFound, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidParams, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerError, message)
    }

    /// Attaches structured data carried in the payload's `data` member.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Flattens the failure into its wire form.
    ///
    /// The payload message is prefixed with the kind name, e.g.
    /// `"InvalidParams: missing required params for method: move"`.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            name: self.kind.name().to_string(),
            code: self.kind.code(),
            message: self.to_string(),
            data: self.data.clone(),
        }
    }
}

impl From<ErrorKind> for RpcError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind, kind.default_message())
    }
}
