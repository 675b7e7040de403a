//! # Ledger of exposed procedures
//!
//! The Ledger is the source of truth for what a local service type exposes to
//! the peer. It pairs each procedure's descriptor with the handler that
//! satisfies it, and is what the router consults when a call arrives.
//!
//! ## Philosophy
//!
//! - **Declared, Not Reflected**: A service lists its procedures through
//!   [`Service::expose`]. Declaration order is wire order: required keys fix the
//!   positional mapping, optional keys carry the defaults applied on omission.
//! - **Registration-Time Safety**: Malformed declarations surface as a
//!   [`LedgerError`] when the ledger is built, never when a call arrives.
//! - **Build Once**: A [`LedgerCache`] keeps one ledger per service type, so
//!   repeated protocol requests are a map lookup.

use std::any::Any;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_json::json;

use tandemrpc::Param;
use tandemrpc::ProcedureDescriptor;
use tandemrpc::Protocol;
use tandemrpc::ProtocolError;
use tandemrpc::RpcError;
use tandemrpc::SET_PROTOCOL;

/// Ledger errors. All of them are configuration mistakes in a service's declaration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// The declared procedures do not form a valid protocol.
    #[error("service '{service}' declares an invalid protocol: {source}")]
    Protocol { service: &'static str, source: ProtocolError },
    /// A required parameter follows an optional one.
    #[error("service '{service}' method '{method}': required parameter '{key}' follows an optional parameter")]
    RequiredAfterOptional { service: &'static str, method: String, key: String },
    /// An optional parameter's default cannot be represented on the wire.
    #[error("service '{service}' method '{method}': default for '{key}' is not representable: {reason}")]
    InvalidDefault { service: &'static str, method: String, key: String, reason: String },
    /// The method name is used by the protocol itself.
    #[error("service '{service}' cannot expose reserved method '{method}'")]
    ReservedName { service: &'static str, method: String },
    /// A method was declared but never given a handler.
    #[error("service '{service}' method '{method}' has no handler")]
    MissingHandler { service: &'static str, method: String },
}

pub type Result<T> = std::result::Result<T, LedgerError>;

type Handler<S> = Arc<dyn Fn(&S, &Arguments) -> anyhow::Result<Value> + Send + Sync>;

/// A local type whose methods can be called by the peer.
///
/// ```ignore
/// impl Service for Map {
///     fn expose(ledger: &mut LedgerBuilder<Self>) {
///         ledger.method("move")
///             .required("x")
///             .required("y")
///             .optional("z", 0)
///             .handler(|map, args| map.move_to(args.get("x")?, args.get("y")?, args.get("z")?));
///     }
/// }
/// ```
pub trait Service: Send + Sync + Sized + 'static {
    fn expose(ledger: &mut LedgerBuilder<Self>);
}

/// Collects a service's declarations while [`Service::expose`] runs.
pub struct LedgerBuilder<S> {
    declared: Vec<String>,
    procedures: Vec<ProcedureDescriptor>,
    handlers: HashMap<String, Handler<S>>,
    errors: Vec<LedgerError>,
}

impl<S: Service> LedgerBuilder<S> {
    fn new() -> Self {
        Self {
            declared: Vec::new(),
            procedures: Vec::new(),
            handlers: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Starts declaring a method. It is registered when `.handler(..)` is attached.
    pub fn method(&mut self, name: impl Into<String>) -> MethodBuilder<'_, S> {
        let name = name.into();
        self.declared.push(name.clone());
        let reserved = name == SET_PROTOCOL;

        let mut method = MethodBuilder {
            ledger: self,
            descriptor: ProcedureDescriptor::new(name),
            failed: false,
        };
        if reserved {
            method.fail(LedgerError::ReservedName {
                service: service_name::<S>(),
                method: SET_PROTOCOL.to_string(),
            });
        }
        method
    }

    fn finish(self) -> Result<Ledger<S>> {
        if let Some(error) = self.errors.into_iter().next() {
            return Err(error);
        }

        if let Some(method) = self.declared.into_iter().find(|m| !self.handlers.contains_key(m)) {
            return Err(LedgerError::MissingHandler { service: service_name::<S>(), method });
        }

        let protocol = Protocol::new(self.procedures).map_err(|source| LedgerError::Protocol {
            service: service_name::<S>(),
            source,
        })?;

        Ok(Ledger { protocol, handlers: self.handlers })
    }
}

/// Declares one method's parameters, then its handler.
#[must_use = "a method is only registered once its handler is attached"]
pub struct MethodBuilder<'a, S> {
    ledger: &'a mut LedgerBuilder<S>,
    descriptor: ProcedureDescriptor,
    failed: bool,
}

impl<S: Service> MethodBuilder<'_, S> {
    /// Records a declaration error with the ledger straight away, so it is
    /// reported even if no handler is ever attached. Only the first counts.
    fn fail(&mut self, error: LedgerError) {
        if !self.failed {
            self.ledger.errors.push(error);
            self.failed = true;
        }
    }

    pub fn required(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !self.descriptor.optional.is_empty() {
            let error = LedgerError::RequiredAfterOptional {
                service: service_name::<S>(),
                method: self.descriptor.name.clone(),
                key: key.clone(),
            };
            self.fail(error);
        }
        self.descriptor = self.descriptor.with_required(key);
        self
    }

    pub fn optional(mut self, key: impl Into<String>, default: impl Serialize) -> Self {
        let key = key.into();
        match serde_json::to_value(default) {
            Ok(default) => {
                self.descriptor = self.descriptor.with_optional(key, default);
            }
            Err(e) => {
                let error = LedgerError::InvalidDefault {
                    service: service_name::<S>(),
                    method: self.descriptor.name.clone(),
                    key,
                    reason: e.to_string(),
                };
                self.fail(error);
            }
        }
        self
    }

    /// Attaches the handler and registers the method.
    ///
    /// A handler that fails with an [`RpcError`] reports that taxonomy member to
    /// the caller as-is; any other failure is reported as a `ServerError`.
    pub fn handler<F>(self, handler: F)
    where
        F: Fn(&S, &Arguments) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        if self.failed {
            return;
        }

        self.ledger.handlers.insert(self.descriptor.name.clone(), Arc::new(handler));
        self.ledger.procedures.push(self.descriptor);
    }
}

/// The built descriptor table and handler table of one service type.
pub struct Ledger<S> {
    protocol: Protocol,
    handlers: HashMap<String, Handler<S>>,
}

impl<S: Service> Ledger<S> {
    /// Runs the service's declarations and validates them.
    pub fn build() -> Result<Self> {
        let mut builder = LedgerBuilder::new();
        S::expose(&mut builder);
        builder.finish()
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn descriptor(&self, procedure: &str) -> Option<&ProcedureDescriptor> {
        self.protocol.get(procedure)
    }

    /// Reconciles `params` against the procedure's descriptor and runs its handler.
    pub fn invoke(&self, service: &S, procedure: &str, params: &[Param]) -> std::result::Result<Value, RpcError> {
        let not_found = || RpcError::method_not_found(format!("Method '{procedure}' not found"));
        let descriptor = self.protocol.get(procedure).ok_or_else(not_found)?;
        let handler = self.handlers.get(procedure).ok_or_else(not_found)?;

        let args = Arguments::reconcile(descriptor, params)?;

        match std::panic::catch_unwind(AssertUnwindSafe(|| handler(service, &args))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(into_rpc_error(error)),
            Err(panic) => Err(RpcError::internal_error(format!(
                "handler for '{procedure}' panicked: {}",
                panic_message(panic.as_ref()),
            ))),
        }
    }
}

impl<S> fmt::Debug for Ledger<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("service", &std::any::type_name::<S>())
            .field("protocol", &self.protocol)
            .finish()
    }
}

fn into_rpc_error(error: anyhow::Error) -> RpcError {
    match error.downcast::<RpcError>() {
        Ok(rpc) => rpc,
        Err(other) => RpcError::server_error(format!("{other:#}")),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

fn service_name<S>() -> &'static str {
    std::any::type_name::<S>()
}

/// The reconciled arguments of one inbound call.
///
/// Required values are always present. Optional values are the supplied value
/// or, when the caller omitted them, the default declared in the descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Arguments {
    procedure: String,
    values: Vec<Argument>,
}

#[derive(Debug, Clone, PartialEq)]
struct Argument {
    key: String,
    value: Value,
    required: bool,
    supplied: bool,
}

impl Arguments {
    /// Matches keyed params against a descriptor.
    ///
    /// Fails with `InvalidParams` when a required key is missing, a key is
    /// unknown to the descriptor, or a key is supplied twice.
    pub fn reconcile(descriptor: &ProcedureDescriptor, params: &[Param]) -> std::result::Result<Self, RpcError> {
        let mut supplied: HashMap<&str, &Value> = HashMap::with_capacity(params.len());
        for param in params {
            if !descriptor.keys().any(|key| key == param.key) {
                return Err(RpcError::invalid_params(format!(
                    "unknown param '{}' for method: {}",
                    param.key, descriptor.name,
                )));
            }
            if supplied.insert(param.key.as_str(), &param.value).is_some() {
                return Err(RpcError::invalid_params(format!(
                    "param '{}' supplied more than once for method: {}",
                    param.key, descriptor.name,
                )));
            }
        }

        let missing: Vec<&str> = descriptor.required.iter()
            .map(|p| p.key.as_str())
            .filter(|key| !supplied.contains_key(key))
            .collect();
        if !missing.is_empty() {
            return Err(RpcError::invalid_params(format!(
                "missing required params for method: {}",
                descriptor.name,
            )).with_data(json!({ "missing": missing })));
        }

        let required = descriptor.required.iter().map(|p| Argument {
            key: p.key.clone(),
            value: supplied.get(p.key.as_str()).map(|v| (*v).clone()).unwrap_or_default(),
            required: true,
            supplied: true,
        });
        let optional = descriptor.optional.iter().map(|p| match supplied.get(p.key.as_str()) {
            Some(value) => Argument {
                key: p.key.clone(),
                value: (*value).clone(),
                required: false,
                supplied: true,
            },
            None => Argument {
                key: p.key.clone(),
                value: p.default.clone(),
                required: false,
                supplied: false,
            },
        });

        Ok(Self {
            procedure: descriptor.name.clone(),
            values: required.chain(optional).collect(),
        })
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.iter().find(|a| a.key == key).map(|a| &a.value)
    }

    /// Deserializes the argument named `key`; a type mismatch is `InvalidParams`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> std::result::Result<T, RpcError> {
        let value = self.value(key).ok_or_else(|| {
            RpcError::invalid_params(format!("method '{}' has no param '{key}'", self.procedure))
        })?;
        T::deserialize(value).map_err(|e| {
            RpcError::invalid_params(format!("param '{key}' of '{}': {e}", self.procedure))
        })
    }

    /// Deserializes the `index`th required argument.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<T, RpcError> {
        let key = self.values.iter()
            .filter(|a| a.required)
            .nth(index)
            .map(|a| a.key.as_str())
            .ok_or_else(|| {
                RpcError::invalid_params(format!("method '{}' has no positional param {index}", self.procedure))
            })?;
        self.get(key)
    }

    /// Whether the caller supplied `key` rather than leaving it to its default.
    pub fn is_supplied(&self, key: &str) -> bool {
        self.values.iter().any(|a| a.key == key && a.supplied)
    }

    /// Required values, in declaration order.
    pub fn positional(&self) -> impl Iterator<Item = &Value> {
        self.values.iter().filter(|a| a.required).map(|a| &a.value)
    }

    /// Optional values the caller supplied, in declaration order.
    pub fn keyword(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter()
            .filter(|a| !a.required && a.supplied)
            .map(|a| (a.key.as_str(), &a.value))
    }
}

/// One ledger per service type, built on first request.
///
/// Shared by reference between routers; safe to use from any thread.
#[derive(Default)]
pub struct LedgerCache {
    ledgers: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl LedgerCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached ledger for `S`, building it on first use.
    pub fn get_or_build<S: Service>(&self) -> Result<Arc<Ledger<S>>> {
        let key = TypeId::of::<S>();

        let cached = self.ledgers.get(&key).map(|entry| Arc::clone(entry.value()));
        if let Some(ledger) = cached.and_then(|c| c.downcast::<Ledger<S>>().ok()) {
            return Ok(ledger);
        }

        let built = Arc::new(Ledger::<S>::build()?);

        // a concurrent build may have won the race; keep whichever landed first
        let stored = Arc::clone(
            self.ledgers
                .entry(key)
                .or_insert_with(|| Arc::clone(&built) as Arc<dyn Any + Send + Sync>)
                .value(),
        );
        Ok(stored.downcast::<Ledger<S>>().unwrap_or(built))
    }

    pub fn contains<S: Service>(&self) -> bool {
        self.ledgers.contains_key(&TypeId::of::<S>())
    }

    pub fn len(&self) -> usize {
        self.ledgers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ledgers.is_empty()
    }
}

impl fmt::Debug for LedgerCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LedgerCache").field("len", &self.ledgers.len()).finish()
    }
}

/// A service instance paired with its ledger, with the service type erased.
pub(crate) trait Target: Send + Sync {
    fn protocol(&self) -> &Protocol;
    fn invoke(&self, procedure: &str, params: &[Param]) -> std::result::Result<Value, RpcError>;
}

pub(crate) struct Bound<S> {
    service: Arc<S>,
    ledger: Arc<Ledger<S>>,
}

impl<S: Service> Bound<S> {
    pub(crate) fn new(service: Arc<S>, ledger: Arc<Ledger<S>>) -> Self {
        Self { service, ledger }
    }
}

impl<S: Service> Target for Bound<S> {
    fn protocol(&self) -> &Protocol {
        self.ledger.protocol()
    }

    fn invoke(&self, procedure: &str, params: &[Param]) -> std::result::Result<Value, RpcError> {
        self.ledger.invoke(&self.service, procedure, params)
    }
}
