//! # tandemrpc
//!
//! Wire layer of a bidirectional remote-procedure protocol spoken over a single
//! order-preserving message channel.
//!
//! ## Architecture
//!
//! Both ends of the channel are peers: each exposes a [`Protocol`] of
//! procedures and can call the other's. Four message shapes travel the
//! channel (Request, Notification, Response and the `set_protocol` capability
//! exchange) in the generic structured form of `serde_json::Value`.
//!
//! This crate is pure data: shapes, classification, descriptors and the error
//! taxonomy. Correlation state and dispatch live in `tandemrun`.

pub mod error;
pub mod message;
pub mod protocol;

pub use error::ErrorKind;
pub use error::ErrorPayload;
pub use error::RpcError;
pub use message::Malformed;
pub use message::Message;
pub use message::Notification;
pub use message::Param;
pub use message::Request;
pub use message::Response;
pub use message::SET_PROTOCOL;
pub use message::SetProtocol;
pub use message::Shape;
pub use message::VERSION;
pub use message::classify;
pub use message::is_notification;
pub use message::is_request;
pub use message::is_response;
pub use message::shape;
pub use protocol::OptionalParam;
pub use protocol::ProcedureDescriptor;
pub use protocol::Protocol;
pub use protocol::ProtocolError;
pub use protocol::RequiredParam;
