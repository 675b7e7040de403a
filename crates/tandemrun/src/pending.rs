//! # Pending-Call Table
//!
//! Outstanding outbound requests, keyed by request id, each holding the
//! resolver that completes the caller's future or callback.
//!
//! Every entry is resolved exactly once: fulfilled or rejected by a correlated
//! response, rejected by its deadline, or rejected when the channel closes.
//! An entry is always removed from the table before its resolver runs.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as Slot;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;
use tracing::error;
use tracing::warn;
use uuid::Uuid;

use tandemrpc::Response;

use crate::ledger::panic_message;
use crate::remote::CallError;

/// What a call eventually produces.
pub type Reply = Result<Value, CallError>;

type Callback = Box<dyn FnOnce(Reply) + Send>;

pub(crate) enum Resolver {
    Future(oneshot::Sender<Reply>),
    // Mutex only to make the entry Sync; it is never contended.
    Callback(Mutex<Callback>),
}

impl Resolver {
    pub(crate) fn callback(callback: impl FnOnce(Reply) + Send + 'static) -> Self {
        Self::Callback(Mutex::new(Box::new(callback)))
    }

    fn resolve(self, procedure: &str, reply: Reply) {
        match self {
            Self::Future(tx) => {
                // receiver dropped means nobody is waiting any more
                let _ = tx.send(reply);
            }
            Self::Callback(callback) => {
                let callback = callback.into_inner().unwrap_or_else(PoisonError::into_inner);
                // a failing callback must not unwind into dispatch or the pump
                if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(reply))) {
                    error!(%procedure, panic = panic_message(panic.as_ref()), "call callback panicked");
                }
            }
        }
    }
}

struct Entry {
    procedure: String,
    resolver: Resolver,
    deadline: Option<Instant>,
    timer: Option<JoinHandle<()>>,
}

impl Entry {
    fn settle(self, reply: Reply) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        self.resolver.resolve(&self.procedure, reply);
    }
}

/// Shared table of outstanding calls. Cloning shares the table.
#[derive(Clone, Default)]
pub struct PendingTable {
    entries: Arc<DashMap<String, Entry>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Ids of every outstanding call, in no particular order.
    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Registers a resolver under a fresh id and returns the id.
    ///
    /// With a `timeout` and a tokio runtime in scope, a timer rejects the call
    /// once the deadline passes. Without a runtime the deadline is only
    /// enforced by [`PendingTable::reap_expired`].
    pub(crate) fn register(&self, procedure: &str, resolver: Resolver, timeout: Option<Duration>) -> String {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut resolver = Some(resolver);

        let id = loop {
            let id = Uuid::new_v4().to_string();
            if let Slot::Vacant(slot) = self.entries.entry(id.clone()) {
                if let Some(resolver) = resolver.take() {
                    slot.insert(Entry {
                        procedure: procedure.to_string(),
                        resolver,
                        deadline,
                        timer: None,
                    });
                }
                break id;
            }
            debug!(%id, "regenerating colliding call id");
        };

        if let Some(timeout) = timeout {
            self.arm(&id, timeout);
        }

        id
    }

    fn arm(&self, id: &str, timeout: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let table = self.clone();
        let timer_id = id.to_string();
        let timer = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            table.expire(&timer_id);
        });

        match self.entries.get_mut(id) {
            Some(mut entry) => entry.timer = Some(timer),
            // already settled before the timer could be attached
            None => timer.abort(),
        }
    }

    /// Settles the call a response correlates to.
    ///
    /// Returns `false`, leaving the table untouched, when no call has that id.
    pub fn resolve(&self, response: Response) -> bool {
        let Some((id, entry)) = self.entries.remove(&response.id) else {
            return false;
        };

        let reply = match response.error {
            Some(payload) => Err(CallError::Remote(payload)),
            None => Ok(response.result),
        };
        debug!(%id, procedure = %entry.procedure, ok = reply.is_ok(), "resolving call");
        entry.settle(reply);
        true
    }

    /// Forgets a call without settling it.
    pub(crate) fn discard(&self, id: &str) -> bool {
        match self.entries.remove(id) {
            Some((_, entry)) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Rejects a call with [`CallError::Timeout`].
    pub fn expire(&self, id: &str) -> bool {
        let Some((id, entry)) = self.entries.remove(id) else {
            return false;
        };

        warn!(%id, procedure = %entry.procedure, "call timed out");
        let procedure = entry.procedure.clone();
        entry.settle(Err(CallError::Timeout { procedure }));
        true
    }

    /// Rejects every call whose deadline has passed. Returns how many were rejected.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self.entries.iter()
            .filter(|e| e.deadline.is_some_and(|deadline| deadline <= now))
            .map(|e| e.key().clone())
            .collect();

        expired.iter().filter(|id| self.expire(id)).count()
    }

    /// Rejects every outstanding call with [`CallError::Closed`].
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for id in self.ids() {
            if let Some((_, entry)) = self.entries.remove(&id) {
                let procedure = entry.procedure.clone();
                entry.settle(Err(CallError::Closed { procedure }));
                closed += 1;
            }
        }
        closed
    }
}

impl fmt::Debug for PendingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTable").field("len", &self.entries.len()).finish()
    }
}

/// The caller's side of an outstanding call.
///
/// Resolves once, with the remote result or the reason the call failed.
#[must_use = "the reply is only observed by awaiting the call"]
pub struct PendingCall {
    id: String,
    procedure: String,
    rx: oneshot::Receiver<Reply>,
}

impl PendingCall {
    pub(crate) fn new(id: String, procedure: String, rx: oneshot::Receiver<Reply>) -> Self {
        Self { id, procedure, rx }
    }

    /// The request id this call was sent with.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }
}

impl Future for PendingCall {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Reply> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(reply)) => Poll::Ready(reply),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CallError::Closed {
                procedure: self.procedure.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("procedure", &self.procedure)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use tandemrpc::ErrorKind;
    use tandemrpc::RpcError;

    fn future_call(table: &PendingTable, procedure: &str, timeout: Option<Duration>) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        let id = table.register(procedure, Resolver::Future(tx), timeout);
        PendingCall::new(id, procedure.to_string(), rx)
    }

    #[test]
    fn test_ids_are_unique() {
        let table = PendingTable::new();
        let ids: HashSet<String> = (0..256)
            .map(|_| table.register("f", Resolver::callback(|_| {}), None))
            .collect();
        assert_eq!(ids.len(), 256);
        assert_eq!(table.len(), 256);
    }

    #[tokio::test]
    async fn test_resolve_fulfils_matching_call() {
        let table = PendingTable::new();
        let first = future_call(&table, "first", None);
        let second = future_call(&table, "second", None);
        let second_id = second.id().to_string();

        assert!(table.resolve(Response::success(&second_id, json!(2))));
        assert_eq!(second.await, Ok(json!(2)));
        assert!(!table.contains(&second_id));
        assert!(table.contains(first.id()));
    }

    #[tokio::test]
    async fn test_error_response_rejects() {
        let table = PendingTable::new();
        let call = future_call(&table, "f", None);
        let err = RpcError::invalid_params("nope");

        assert!(table.resolve(Response::failure(call.id(), &err)));
        let Err(CallError::Remote(payload)) = call.await else {
            panic!("expected a remote rejection");
        };
        assert_eq!(payload.kind(), Some(ErrorKind::InvalidParams));
    }

    #[test]
    fn test_unknown_id_is_noop() {
        let table = PendingTable::new();
        let _call = future_call(&table, "f", None);
        let before = table.ids();

        assert!(!table.resolve(Response::success("missing", json!(1))));
        assert_eq!(table.ids(), before);
    }

    #[test]
    fn test_callback_runs_once_after_removal() {
        let table = PendingTable::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let inner = table.clone();
        let id = table.register("f", Resolver::callback(move |reply| {
            // the entry is gone by the time the callback runs
            sink.lock().unwrap().push((reply, inner.len()));
        }), None);

        assert!(table.resolve(Response::success(&id, json!("ok"))));
        assert!(!table.resolve(Response::success(&id, json!("again"))));
        assert_eq!(*seen.lock().unwrap(), vec![(Ok(json!("ok")), 0)]);
    }

    #[tokio::test]
    async fn test_panicking_callback_is_contained() {
        let table = PendingTable::new();
        let id = table.register("f", Resolver::callback(|_| panic!("callback blew up")), None);
        let other = future_call(&table, "g", None);

        assert!(table.resolve(Response::success(&id, json!(1))));
        assert!(!table.contains(&id));

        // a panic during close does not stop the remaining calls from settling
        table.register("h", Resolver::callback(|_| panic!("again")), None);
        assert_eq!(table.close_all(), 2);
        assert!(table.is_empty());
        assert_eq!(other.await, Err(CallError::Closed { procedure: "g".into() }));
    }

    #[tokio::test]
    async fn test_close_all_rejects_everything() {
        let table = PendingTable::new();
        let a = future_call(&table, "a", None);
        let b = future_call(&table, "b", None);

        assert_eq!(table.close_all(), 2);
        assert!(table.is_empty());
        assert_eq!(a.await, Err(CallError::Closed { procedure: "a".into() }));
        assert_eq!(b.await, Err(CallError::Closed { procedure: "b".into() }));
    }

    #[tokio::test]
    async fn test_discard_drops_without_settling() {
        let table = PendingTable::new();
        let call = future_call(&table, "f", None);
        let id = call.id().to_string();

        assert!(table.discard(&id));
        assert!(!table.discard(&id));
        // dropped sender surfaces as a closed channel
        assert_eq!(call.await, Err(CallError::Closed { procedure: "f".into() }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_rejects_after_deadline() {
        let table = PendingTable::new();
        let call = future_call(&table, "slow", Some(Duration::from_millis(50)));

        assert_eq!(call.await, Err(CallError::Timeout { procedure: "slow".into() }));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_before_deadline_wins() {
        let table = PendingTable::new();
        let call = future_call(&table, "quick", Some(Duration::from_secs(1)));

        assert!(table.resolve(Response::success(call.id(), json!(true))));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(call.await, Ok(json!(true)));
    }

    #[test]
    fn test_reap_expired_without_runtime() {
        let table = PendingTable::new();
        let rejected = Arc::new(Mutex::new(Vec::new()));
        let sink = rejected.clone();
        table.register("never", Resolver::callback(|_| {}), None);
        table.register("zero", Resolver::callback(move |reply| sink.lock().unwrap().push(reply)), Some(Duration::ZERO));

        assert_eq!(table.reap_expired(), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(*rejected.lock().unwrap(), vec![Err(CallError::Timeout { procedure: "zero".into() })]);
    }
}
