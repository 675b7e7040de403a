//! # Router
//!
//! The inbound half of a peer. Every message the host receives goes through
//! [`Router::dispatch`], which classifies it and either settles a pending call,
//! runs a local handler, or installs the peer's announced protocol.
//!
//! A router exposes one default service plus any number of services under
//! object ids. Requests pick a target with their `object` field; the legacy
//! `"<object>.<procedure>"` method form is honored only when the prefix names
//! a registered object.
//!
//! ## Lifecycle
//!
//! 1. Build with [`Router::builder`], exposing local services.
//! 2. [`Router::announce`] the local protocol so the peer can build its proxy.
//! 3. Feed inbound messages to `dispatch`, or let [`Router::serve`] pump an
//!    [`Inbound`] source.
//! 4. Call the peer through the [`Remote`] installed by its announcement.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use tandemrpc::ErrorKind;
use tandemrpc::Malformed;
use tandemrpc::Message;
use tandemrpc::Notification;
use tandemrpc::Param;
use tandemrpc::Protocol;
use tandemrpc::Request;
use tandemrpc::Response;
use tandemrpc::RpcError;
use tandemrpc::SetProtocol;
use tandemrpc::classify;

use crate::config::RouterConfig;
use crate::ledger::Bound;
use crate::ledger::LedgerCache;
use crate::ledger::LedgerError;
use crate::ledger::Service;
use crate::ledger::Target;
use crate::pending::PendingTable;
use crate::remote::Remote;
use crate::transport::Inbound;
use crate::transport::Outbound;
use crate::transport::TransportError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("object '{0}' is exposed more than once")]
    DuplicateObject(String),
    #[error("object id cannot be empty")]
    EmptyObjectId,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnnounceError {
    #[error("no object '{0}' is exposed")]
    UnknownObject(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// What dispatching one inbound message did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A response settled the pending call with this id.
    Resolved { id: String },
    /// A response arrived for an id with no pending call; nothing changed.
    Orphaned { id: String },
    /// A request was answered; `error` is set when the reply was an error.
    Replied { id: String, error: Option<ErrorKind> },
    /// A notification ran; `error` is set when it failed. Nothing was sent.
    Notified { method: String, error: Option<ErrorKind> },
    /// The peer announced its protocol and a proxy was installed.
    ProtocolInstalled { object: Option<String>, procedures: usize },
    /// The message could not be understood and had no id to answer.
    Unparseable(RpcError),
}

type Binder = Box<dyn FnOnce(&LedgerCache) -> Result<Arc<dyn Target>, LedgerError>>;

fn bind<S: Service>(service: Arc<S>) -> Binder {
    Box::new(move |cache: &LedgerCache| {
        let ledger = cache.get_or_build::<S>()?;
        Ok(Arc::new(Bound::new(service, ledger)) as Arc<dyn Target>)
    })
}

/// Configures the services a router exposes.
pub struct RouterBuilder {
    config: RouterConfig,
    cache: Option<Arc<LedgerCache>>,
    default: Option<Binder>,
    objects: Vec<(String, Binder)>,
}

impl RouterBuilder {
    fn new() -> Self {
        Self {
            config: RouterConfig::default(),
            cache: None,
            default: None,
            objects: Vec::new(),
        }
    }

    pub fn config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    /// Shares a ledger cache with other routers.
    pub fn cache(mut self, cache: Arc<LedgerCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Exposes `service` as the default target.
    pub fn expose<S: Service>(mut self, service: Arc<S>) -> Self {
        self.default = Some(bind(service));
        self
    }

    /// Exposes `service` under the object id `id`.
    pub fn expose_as<S: Service>(mut self, id: impl Into<String>, service: Arc<S>) -> Self {
        self.objects.push((id.into(), bind(service)));
        self
    }

    /// Builds every exposed ledger and returns a router sending through `outbound`.
    pub fn build(self, outbound: Arc<dyn Outbound>) -> Result<Router, BuildError> {
        let cache = self.cache.unwrap_or_default();

        let default = self.default.map(|bind| bind(&cache)).transpose()?;

        let mut objects = HashMap::with_capacity(self.objects.len());
        for (id, bind) in self.objects {
            if id.is_empty() {
                return Err(BuildError::EmptyObjectId);
            }
            if objects.contains_key(&id) {
                return Err(BuildError::DuplicateObject(id));
            }
            objects.insert(id, bind(&cache)?);
        }

        Ok(Router {
            config: self.config,
            outbound,
            pending: PendingTable::new(),
            default,
            objects,
            remotes: DashMap::new(),
            installed: Notify::new(),
        })
    }
}

/// One side of the channel: dispatches what arrives and owns the proxies for
/// what the peer exposes.
pub struct Router {
    config: RouterConfig,
    outbound: Arc<dyn Outbound>,
    pending: PendingTable,
    default: Option<Arc<dyn Target>>,
    objects: HashMap<String, Arc<dyn Target>>,
    remotes: DashMap<Option<String>, Remote>,
    installed: Notify,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// The protocol of the default service; empty when none is exposed.
    pub fn protocol(&self) -> Protocol {
        self.default.as_ref().map(|t| t.protocol().clone()).unwrap_or_default()
    }

    pub fn object_protocol(&self, id: &str) -> Option<&Protocol> {
        self.objects.get(id).map(|t| t.protocol())
    }

    /// Ids of the objects exposed besides the default service.
    pub fn objects(&self) -> impl Iterator<Item = &str> {
        self.objects.keys().map(String::as_str)
    }

    /// Sends the default protocol to the peer.
    pub fn announce(&self) -> Result<(), TransportError> {
        let protocol = self.protocol();
        info!(procedures = protocol.len(), "announcing protocol");
        self.outbound.send(SetProtocol::new(protocol).to_value())
    }

    /// Sends the protocol of object `id` to the peer.
    pub fn announce_object(&self, id: &str) -> Result<(), AnnounceError> {
        let protocol = self.object_protocol(id)
            .ok_or_else(|| AnnounceError::UnknownObject(id.to_string()))?;
        info!(object = id, procedures = protocol.len(), "announcing protocol");
        self.outbound.send(SetProtocol::for_object(id, protocol.clone()).to_value())?;
        Ok(())
    }

    /// Installs a proxy for the peer's default protocol received out of band.
    pub fn connect(&self, protocol: Protocol) -> Remote {
        self.install(None, protocol)
    }

    /// Installs a proxy for the peer object `id`.
    pub fn connect_object(&self, id: impl Into<String>, protocol: Protocol) -> Remote {
        self.install(Some(id.into()), protocol)
    }

    /// The proxy for the peer's default protocol, once announced.
    pub fn remote(&self) -> Option<Remote> {
        self.remotes.get(&None::<String>).map(|r| r.value().clone())
    }

    /// The proxy for peer object `id`, once announced.
    pub fn remote_for(&self, id: &str) -> Option<Remote> {
        self.remotes.get(&Some(id.to_string())).map(|r| r.value().clone())
    }

    /// Waits until the peer's default protocol has been installed.
    pub async fn wait_for_remote(&self) -> Remote {
        self.wait_for(None).await
    }

    /// Waits until the protocol of peer object `id` has been installed.
    pub async fn wait_for_object(&self, id: &str) -> Remote {
        self.wait_for(Some(id.to_string())).await
    }

    async fn wait_for(&self, key: Option<String>) -> Remote {
        loop {
            let notified = self.installed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(remote) = self.remotes.get(&key) {
                return remote.value().clone();
            }
            notified.await;
        }
    }

    fn install(&self, object: Option<String>, protocol: Protocol) -> Remote {
        let remote = Remote::new(protocol, Arc::clone(&self.outbound), self.pending.clone(), self.config.clone());
        let remote = match &object {
            Some(id) => remote.object(id.clone()),
            None => remote,
        };

        if self.remotes.insert(object.clone(), remote.clone()).is_some() {
            debug!(object = ?object, "replacing remote protocol");
        }
        self.installed.notify_waiters();
        remote
    }

    /// Classifies and handles one inbound message.
    pub fn dispatch(&self, message: &Value) -> Outcome {
        match classify(message) {
            Ok(Message::Response(response)) => self.on_response(response),
            Ok(Message::Request(request)) => self.on_request(request),
            Ok(Message::Notification(notification)) => self.on_notification(notification),
            Ok(Message::SetProtocol(set)) => self.on_set_protocol(set),
            Err(Malformed { error, id: Some(id) }) => {
                warn!(%id, code = error.kind().code(), %error, "rejecting malformed request");
                self.reply(Response::failure(&id, &error));
                Outcome::Replied { id, error: Some(error.kind()) }
            }
            Err(Malformed { error, id: None }) => {
                error!(code = error.kind().code(), %error, "dropping unparseable message");
                Outcome::Unparseable(error)
            }
        }
    }

    /// Pumps `inbound` into [`Router::dispatch`] until it closes, then
    /// rejects every call still pending.
    pub fn serve(self: &Arc<Self>, inbound: Arc<dyn Inbound>) -> JoinHandle<()> {
        let router = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(Some(message)) => {
                        router.dispatch(&message);
                    }
                    Ok(None) => {
                        debug!("inbound channel closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "inbound channel failed");
                        break;
                    }
                }
            }

            let closed = router.pending.close_all();
            if closed > 0 {
                warn!(closed, "rejected calls left pending on close");
            }
        })
    }

    fn on_response(&self, response: Response) -> Outcome {
        let id = response.id.clone();
        if self.pending.resolve(response) {
            Outcome::Resolved { id }
        } else {
            warn!(%id, "no pending call for response");
            Outcome::Orphaned { id }
        }
    }

    fn on_request(&self, request: Request) -> Outcome {
        let Request { method, params, id, object, .. } = request;
        debug!(%id, %method, object = ?object, "dispatching request");

        let response = match self.invoke(&method, object.as_deref(), &params) {
            Ok(result) => Response::success(&id, result),
            Err(e) => {
                debug!(%id, %method, code = e.kind().code(), error = %e, "request failed");
                Response::failure(&id, &e)
            }
        };

        let error = response.error.as_ref().and_then(|e| e.kind());
        self.reply(response);
        Outcome::Replied { id, error }
    }

    fn on_notification(&self, notification: Notification) -> Outcome {
        let Notification { method, params, object, .. } = notification;
        debug!(%method, object = ?object, "dispatching notification");

        let error = match self.invoke(&method, object.as_deref(), &params) {
            Ok(_) => None,
            Err(e) => {
                warn!(%method, code = e.kind().code(), error = %e, "notification failed");
                Some(e.kind())
            }
        };
        Outcome::Notified { method, error }
    }

    fn on_set_protocol(&self, set: SetProtocol) -> Outcome {
        let SetProtocol { data, object, .. } = set;
        let procedures = data.len();
        info!(object = ?object, procedures, "installing remote protocol");

        self.install(object.clone(), data);
        Outcome::ProtocolInstalled { object, procedures }
    }

    fn invoke(&self, method: &str, object: Option<&str>, params: &[Param]) -> Result<Value, RpcError> {
        let (target, procedure) = self.route(method, object)?;
        target.invoke(procedure, params)
    }

    fn route<'a>(&'a self, method: &'a str, object: Option<&str>) -> Result<(&'a Arc<dyn Target>, &'a str), RpcError> {
        if let Some(id) = object {
            let target = self.objects.get(id)
                .ok_or_else(|| RpcError::method_not_found(format!("Object '{id}' not found")))?;
            return Ok((target, method));
        }

        if let Some((prefix, procedure)) = method.split_once('.') {
            if let Some(target) = self.objects.get(prefix) {
                return Ok((target, procedure));
            }
        }

        self.default.as_ref()
            .map(|target| (target, method))
            .ok_or_else(|| RpcError::internal_error(format!(
                "no default service exposed to serve '{method}'; protocol negotiation is not complete",
            )))
    }

    fn reply(&self, response: Response) {
        if let Err(e) = self.outbound.send(response.to_value()) {
            error!(id = %response.id, error = %e, "failed to send reply");
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("config", &self.config)
            .field("default", &self.default.as_ref().map(|t| t.protocol().len()))
            .field("objects", &self.objects.keys().collect::<Vec<_>>())
            .field("remotes", &self.remotes.len())
            .field("pending", &self.pending)
            .finish()
    }
}
