//! # Transport Abstraction
//!
//! The engine's only view of the channel: a way to push a message to the peer,
//! and optionally a way to pull the next message from it.
//!
//! ## Philosophy
//!
//! - **Message-Oriented**: Transports move already-decoded `serde_json::Value`s.
//!   Framing and byte encoding belong to the host.
//! - **Fire-and-Forget**: `send` returns once the message is handed off. The
//!   transport promises eventual, order-preserving delivery; replies come back
//!   through the inbound side and are correlated by id, never by `send`.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::mpsc;

/// Errors that occur at the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer is unreachable or the channel was dropped.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    /// Generic I/O error or internal transport failure.
    #[error("i/o error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Pushes a message toward the peer.
///
/// Object-safe (`Arc<dyn Outbound>`). Any `Fn(Value) -> Result<()>` closure is
/// an `Outbound`, so a host can hand in its channel's send function directly.
pub trait Outbound: Send + Sync + 'static {
    fn send(&self, message: Value) -> Result<()>;
}

impl<F> Outbound for F
where
    F: Fn(Value) -> Result<()> + Send + Sync + 'static,
{
    fn send(&self, message: Value) -> Result<()> {
        self(message)
    }
}

/// Pulls the next message from the peer.
///
/// Only needed when the host lets [`crate::Router::serve`] pump the channel;
/// hosts with their own event loop call `Router::dispatch` directly.
#[async_trait::async_trait]
pub trait Inbound: Send + Sync + 'static {
    /// Returns `Ok(None)` once the channel is closed.
    async fn recv(&self) -> Result<Option<Value>>;
}

/// An in-process duplex channel built on tokio mpsc channels.
///
/// Messages sent on one end appear on the other end's `recv()`.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Value>,
    rx: Mutex<mpsc::UnboundedReceiver<Value>>,
}

impl ChannelTransport {
    pub fn new(tx: mpsc::UnboundedSender<Value>, rx: mpsc::UnboundedReceiver<Value>) -> Self {
        Self { tx, rx: Mutex::new(rx) }
    }

    /// Creates two transports connected to each other.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        (Arc::new(Self::new(tx_a, rx_b)), Arc::new(Self::new(tx_b, rx_a)))
    }
}

impl fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl Outbound for ChannelTransport {
    fn send(&self, message: Value) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| TransportError::ConnectionLost("channel closed".into()))
    }
}

#[async_trait::async_trait]
impl Inbound for ChannelTransport {
    async fn recv(&self) -> Result<Option<Value>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }
}

/// An outbound that records every message instead of delivering it.
///
/// Used by hosts and tests that drive `Router::dispatch` by hand and inspect
/// what the engine would have sent.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    sent: Arc<std::sync::Mutex<Vec<Value>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every message sent so far.
    pub fn sent(&self) -> Vec<Value> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Removes and returns every message sent so far.
    pub fn take(&self) -> Vec<Value> {
        match self.sent.lock() {
            Ok(mut sent) => std::mem::take(&mut *sent),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn last(&self) -> Option<Value> {
        self.sent().pop()
    }

    pub fn len(&self) -> usize {
        self.sent().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Outbound for Recorder {
    fn send(&self, message: Value) -> Result<()> {
        match self.sent.lock() {
            Ok(mut sent) => sent.push(message),
            Err(poisoned) => poisoned.into_inner().push(message),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_pair_is_duplex() {
        let (a, b) = ChannelTransport::pair();

        a.send(json!({"from": "a"})).unwrap();
        b.send(json!({"from": "b"})).unwrap();

        assert_eq!(b.recv().await.unwrap(), Some(json!({"from": "a"})));
        assert_eq!(a.recv().await.unwrap(), Some(json!({"from": "b"})));
    }

    #[tokio::test]
    async fn test_channel_preserves_order() {
        let (a, b) = ChannelTransport::pair();
        for i in 0..5 {
            a.send(json!(i)).unwrap();
        }
        for i in 0..5 {
            assert_eq!(b.recv().await.unwrap(), Some(json!(i)));
        }
    }

    #[tokio::test]
    async fn test_send_after_peer_dropped_fails() {
        let (a, b) = ChannelTransport::pair();
        drop(b);
        let err = a.send(json!({})).unwrap_err();
        assert!(matches!(err, TransportError::ConnectionLost(_)));
    }

    #[test]
    fn test_closure_is_outbound() {
        let recorder = Recorder::new();
        let sink = recorder.clone();
        let outbound: Arc<dyn Outbound> = Arc::new(move |msg: Value| sink.send(msg));

        outbound.send(json!({"hello": "world"})).unwrap();
        assert_eq!(recorder.take(), vec![json!({"hello": "world"})]);
        assert!(recorder.is_empty());
    }
}
