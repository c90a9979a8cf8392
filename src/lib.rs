//! trunkline — reactor core for a multi-protocol RPC transport.
//!
//! A [`Messenger`] owns a fixed pool of reactors: single-threaded epoll
//! event loops that each own a subset of the process's connections and
//! their timers. Producer threads hand work to a reactor through a
//! lock-guarded task queue and an eventfd wakeup; every mutation of
//! reactor state happens on the reactor's own thread. Connection
//! negotiation (the protocol handshake) is the one job deliberately run
//! off-thread, on a dedicated worker pool, and its completion re-enters
//! through the task queue.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use trunkline::{ConfigBuilder, ConnectionId, Messenger, OutboundCall, UserCredentials};
//! use bytes::Bytes;
//!
//! fn main() -> Result<(), trunkline::Error> {
//!     let config = ConfigBuilder::new("client").reactors(2).build()?;
//!     let messenger = Messenger::new(config)?;
//!
//!     let conn_id = ConnectionId::new(
//!         "127.0.0.1:7878".parse().unwrap(),
//!         UserCredentials::new("app"),
//!         0,
//!     );
//!     let call = OutboundCall::new(conn_id, Bytes::from_static(b"ping"), None)
//!         .on_completion(|result| println!("call finished: {result:?}"));
//!     messenger.queue_outbound_call(call);
//!
//!     messenger.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux only. The event loop is epoll + eventfd + timerfd.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod acceptor;
pub(crate) mod metrics;
pub(crate) mod poll;
pub(crate) mod reactor;
pub(crate) mod socket;

// ── Public modules ──────────────────────────────────────────────────────
pub mod call;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod messenger;
pub mod negotiation;
pub mod task;

// ── Re-exports ──────────────────────────────────────────────────────────

/// Outbound call handed to [`Messenger::queue_outbound_call`].
pub use call::{OutboundCall, RpcController};
/// Messenger configuration.
pub use config::{Config, ConfigBuilder};
/// Connection identity and dump records.
pub use connection::{Connection, ConnectionId, ConnectionInfo, Direction, UserCredentials};
/// Protocol framing seam.
pub use context::{ConnectionContext, ContextFactory, DelimitedContext, ResponseSink};
/// Status kinds reported by the core.
pub use error::{Error, Result};
/// Owner of the reactor pool.
pub use messenger::{DumpRunningRpcsRequest, DumpRunningRpcsResponse, Messenger};
/// Pluggable connection handshake.
pub use negotiation::{Negotiator, NoopNegotiator};
/// Per-reactor connection counts.
pub use reactor::ReactorMetrics;
/// Delayed-task identity, cancellable through the messenger.
pub use task::DelayedTaskId;
