//! # tandemrun
//!
//! The engine of the tandem protocol: a [`Router`] that dispatches inbound
//! messages to local services, a [`Remote`] proxy that turns local calls into
//! requests, and the [`PendingTable`] that correlates replies with the calls
//! that caused them.
//!
//! Local services declare their surface through [`Service`]; the built
//! [`Ledger`] is what gets announced to the peer.

pub mod config;
pub mod ledger;
pub mod pending;
pub mod remote;
pub mod router;
pub mod transport;

pub use config::RouterConfig;
pub use ledger::Arguments;
pub use ledger::Ledger;
pub use ledger::LedgerBuilder;
pub use ledger::LedgerCache;
pub use ledger::LedgerError;
pub use ledger::MethodBuilder;
pub use ledger::Service;
pub use pending::PendingCall;
pub use pending::PendingTable;
pub use pending::Reply;
pub use remote::Args;
pub use remote::ArityError;
pub use remote::CallError;
pub use remote::Procedure;
pub use remote::Remote;
pub use router::AnnounceError;
pub use router::BuildError;
pub use router::Outcome;
pub use router::Router;
pub use router::RouterBuilder;
pub use transport::ChannelTransport;
pub use transport::Inbound;
pub use transport::Outbound;
pub use transport::Recorder;
pub use transport::TransportError;
