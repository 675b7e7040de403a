//! # Remote Proxy
//!
//! A [`Remote`] is the local stand-in for the peer's surface. It is built from
//! the protocol the peer announced and turns local calls into requests.
//!
//! Arguments are checked against the procedure's descriptor before anything is
//! sent, so a call with the wrong shape fails synchronously and the channel
//! never sees it. Required parameters are positional; optional parameters are
//! passed by keyword and omitted from the wire when not supplied.

use std::fmt;
use std::sync::Arc;

use serde_json::Map;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use tandemrpc::ErrorPayload;
use tandemrpc::Notification;
use tandemrpc::Param;
use tandemrpc::ProcedureDescriptor;
use tandemrpc::Protocol;
use tandemrpc::Request;

use crate::config::RouterConfig;
use crate::pending::PendingCall;
use crate::pending::PendingTable;
use crate::pending::Reply;
use crate::pending::Resolver;
use crate::transport::Outbound;
use crate::transport::TransportError;

/// A call whose arguments do not fit the procedure's descriptor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArityError {
    #[error("'{procedure}' takes {expected} positional argument(s), got {got}")]
    TooFew { procedure: String, expected: usize, got: usize },
    #[error("'{procedure}' takes at most {expected} argument(s), got {got}")]
    TooMany { procedure: String, expected: usize, got: usize },
    #[error("'{procedure}' takes {expected} positional argument(s); '{key}' must be passed by keyword")]
    PositionalOptional { procedure: String, expected: usize, key: String },
    #[error("'{procedure}' has no optional parameter '{key}'")]
    UnknownKeyword { procedure: String, key: String },
}

/// Why an outbound call failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CallError {
    #[error("procedure '{0}' is not part of the remote protocol")]
    UnknownProcedure(String),
    #[error(transparent)]
    Arity(#[from] ArityError),
    #[error("failed to send call: {0}")]
    Transport(#[from] TransportError),
    /// The peer answered with an error payload.
    #[error("remote error: {0}")]
    Remote(ErrorPayload),
    #[error("call to '{procedure}' timed out")]
    Timeout { procedure: String },
    #[error("channel closed before '{procedure}' was answered")]
    Closed { procedure: String },
}

/// Arguments of an outbound call: positional values for the required
/// parameters, keyword values for the optional ones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    positional: Vec<Value>,
    keyword: Map<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(values: impl IntoIterator<Item = Value>) -> Self {
        Self {
            positional: values.into_iter().collect(),
            keyword: Map::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(key.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.positional.len() + self.keyword.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Validates `args` against `descriptor` and lays them out as keyed params.
///
/// Positionals map onto required keys in order; supplied keywords follow in
/// the descriptor's optional order.
pub fn build_params(descriptor: &ProcedureDescriptor, args: &Args) -> Result<Vec<Param>, ArityError> {
    let procedure = || descriptor.name.clone();
    let required = descriptor.required.len();
    let got = args.positional.len();

    if args.len() > descriptor.max_args() {
        return Err(ArityError::TooMany {
            procedure: procedure(),
            expected: descriptor.max_args(),
            got: args.len(),
        });
    }
    if got < required {
        return Err(ArityError::TooFew { procedure: procedure(), expected: required, got });
    }
    if got > required {
        return Err(ArityError::PositionalOptional {
            procedure: procedure(),
            expected: required,
            key: descriptor.optional[0].key.clone(),
        });
    }
    if let Some(key) = args.keyword.keys().find(|k| descriptor.optional_param(k).is_none()) {
        return Err(ArityError::UnknownKeyword { procedure: procedure(), key: key.clone() });
    }

    let positional = descriptor.required.iter()
        .zip(&args.positional)
        .map(|(p, value)| Param::required(p.key.clone(), value.clone()));
    let keyword = descriptor.optional.iter()
        .filter_map(|p| args.keyword.get(&p.key).map(|value| Param::optional(p.key.clone(), value.clone())));

    Ok(positional.chain(keyword).collect())
}

struct Inner {
    protocol: Protocol,
    outbound: Arc<dyn Outbound>,
    pending: PendingTable,
    config: RouterConfig,
}

/// Proxy for the peer's procedures. Cheap to clone; clones share the channel
/// and the pending-call table.
#[derive(Clone)]
pub struct Remote {
    inner: Arc<Inner>,
    object: Option<String>,
}

impl Remote {
    pub fn new(protocol: Protocol, outbound: Arc<dyn Outbound>, pending: PendingTable, config: RouterConfig) -> Self {
        Self {
            inner: Arc::new(Inner { protocol, outbound, pending, config }),
            object: None,
        }
    }

    /// The same proxy, addressing the remote object `id` instead.
    pub fn object(&self, id: impl Into<String>) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            object: Some(id.into()),
        }
    }

    /// The remote object this proxy addresses, if not the peer's default.
    pub fn target(&self) -> Option<&str> {
        self.object.as_deref()
    }

    pub fn protocol(&self) -> &Protocol {
        &self.inner.protocol
    }

    pub fn pending(&self) -> &PendingTable {
        &self.inner.pending
    }

    pub fn procedure(&self, name: &str) -> Option<Procedure<'_>> {
        self.inner.protocol.get(name).map(|descriptor| Procedure { remote: self, descriptor })
    }

    /// One wrapper per remote procedure, in protocol order.
    pub fn procedures(&self) -> impl Iterator<Item = Procedure<'_>> {
        self.inner.protocol.iter().map(|descriptor| Procedure { remote: self, descriptor })
    }

    /// Calls `procedure`, returning a future of its reply.
    pub fn call(&self, procedure: &str, args: Args) -> Result<PendingCall, CallError> {
        let params = self.params(procedure, &args)?;
        let (tx, rx) = oneshot::channel();
        let id = self.inner.pending.register(procedure, Resolver::Future(tx), self.inner.config.call_timeout);
        self.send_request(procedure, params, &id)?;
        Ok(PendingCall::new(id, procedure.to_string(), rx))
    }

    /// Calls `procedure` and runs `callback` with its reply.
    ///
    /// The callback runs on whichever thread dispatches the response, or the
    /// timer that rejects it. Returns the request id.
    pub fn call_with<F>(&self, procedure: &str, args: Args, callback: F) -> Result<String, CallError>
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        let params = self.params(procedure, &args)?;
        let id = self.inner.pending.register(procedure, Resolver::callback(callback), self.inner.config.call_timeout);
        self.send_request(procedure, params, &id)?;
        Ok(id)
    }

    /// Sends `procedure` as a notification. Nothing comes back.
    pub fn notify(&self, procedure: &str, args: Args) -> Result<(), CallError> {
        let params = self.params(procedure, &args)?;

        let mut notification = Notification::new(procedure, params);
        notification.jsonrpc = self.inner.config.version.clone();
        notification.object = self.object.clone();

        debug!(method = procedure, object = ?self.object, "sending notification");
        self.inner.outbound.send(notification.to_value())?;
        Ok(())
    }

    fn params(&self, procedure: &str, args: &Args) -> Result<Vec<Param>, CallError> {
        let descriptor = self.inner.protocol.get(procedure)
            .ok_or_else(|| CallError::UnknownProcedure(procedure.to_string()))?;
        Ok(build_params(descriptor, args)?)
    }

    fn send_request(&self, procedure: &str, params: Vec<Param>, id: &str) -> Result<(), CallError> {
        let mut request = Request::new(procedure, params, id);
        request.jsonrpc = self.inner.config.version.clone();
        request.object = self.object.clone();

        debug!(id, method = procedure, object = ?self.object, "sending request");
        if let Err(e) = self.inner.outbound.send(request.to_value()) {
            self.inner.pending.discard(id);
            return Err(CallError::Transport(e));
        }
        Ok(())
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("object", &self.object)
            .field("procedures", &self.inner.protocol.names().collect::<Vec<_>>())
            .finish()
    }
}

/// One remote procedure, bound to its proxy.
#[derive(Debug, Clone, Copy)]
pub struct Procedure<'a> {
    remote: &'a Remote,
    descriptor: &'a ProcedureDescriptor,
}

impl<'a> Procedure<'a> {
    pub fn name(&self) -> &'a str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &'a ProcedureDescriptor {
        self.descriptor
    }

    pub fn call(&self, args: Args) -> Result<PendingCall, CallError> {
        self.remote.call(&self.descriptor.name, args)
    }

    pub fn call_with<F>(&self, args: Args, callback: F) -> Result<String, CallError>
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        self.remote.call_with(&self.descriptor.name, args, callback)
    }

    pub fn notify(&self, args: Args) -> Result<(), CallError> {
        self.remote.notify(&self.descriptor.name, args)
    }
}
