//! # Warren
//!
//! A reliable, flow-controlled bridge between a message-broker queue and
//! a pool of isolated workers.
//!
//! ## Features
//!
//! - **Worker isolation**: Each worker runs the handler in its own task
//!   over private channels; a panic kills one worker, never the pool
//! - **At-least-once delivery**: Acks only after successful processing;
//!   crashed workers' in-flight messages are requeued with the broker
//! - **Flow control**: Broker prefetch window plus an optional local
//!   cache soft limit bound memory under load
//! - **Self-healing pool**: Crashed and unresponsive workers are reaped
//!   and replaced to hold the configured pool size
//! - **Lifecycle events**: `processed`, `workerExit`, `error`, and
//!   `shutdown` hooks with a stats snapshot and a control handle
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Connection                           │
//! │  (broker seam: subscribe, poll, ack/nack with prefetch)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                           │
//! │  (control loop: consume → cache → assign FIFO → settle)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                           │
//! │  (isolated worker tasks running the handler, one message    │
//! │   at a time; reaped and respawned on crash)                 │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use warren::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let conn = Arc::new(InMemoryConnection::new());
//!     conn.publish(b"job".to_vec());
//!
//!     let handler = handler_fn(|envelope: Envelope| async move {
//!         println!("processing {} bytes", envelope.len());
//!         HandlerOutcome::Done
//!     });
//!
//!     let config = DispatcherConfig::new(vec!["jobs".into()])
//!         .with_num_workers(4)
//!         .with_prefetch(10);
//!
//!     let mut dispatcher = Dispatcher::new(conn, handler, config);
//!     dispatcher.on(EventKind::Processed, |_, ctx| {
//!         if ctx.stats().processed == 1 {
//!             ctx.shutdown();
//!         }
//!     });
//!
//!     let stats = dispatcher.run().await?;
//!     println!("processed {} messages", stats.processed);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handler;
pub mod message;
pub mod signal;
pub mod stats;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::DispatcherConfig;
    pub use crate::connection::{Connection, InMemoryConnection};
    pub use crate::dispatcher::{ControlHandle, Dispatcher, DispatcherPhase};
    pub use crate::error::{Result, WarrenError};
    pub use crate::events::{DispatcherEvent, EventContext, EventKind};
    pub use crate::handler::{handler_fn, Handler, HandlerOutcome};
    pub use crate::message::{DeliveryTag, Envelope};
    pub use crate::signal::Signal;
    pub use crate::stats::StatsSnapshot;
}

// Re-export key types at crate root
pub use config::DispatcherConfig;
pub use connection::{Connection, InMemoryConnection};
pub use dispatcher::{ControlHandle, Dispatcher, DispatcherPhase};
pub use error::{Result, WarrenError};
pub use events::{DispatcherEvent, EventCallback, EventContext, EventKind, EventRegistry};
pub use handler::{handler_fn, Handler, HandlerOutcome};
pub use message::{DeliveryTag, Envelope};
pub use signal::{Signal, SignalCallback};
pub use stats::{StatCounters, StatsSnapshot};
pub use worker::{WorkerId, WorkerPool, WorkerState};
