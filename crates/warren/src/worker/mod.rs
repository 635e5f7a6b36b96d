//! Worker units and the pool that manages them
//!
//! This module provides:
//! - [`WorkerUnit`] - One isolated task running the user handler, one
//!   message at a time, over private channels
//! - [`WorkerPool`] - Spawn/terminate/reap lifecycle keeping the
//!   configured number of units alive
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       WorkerPool                         │
//! │   id → WorkerUnit    id → WorkerUnit    id → WorkerUnit  │
//! │         │                   │                  │         │
//! │   command / report    command / report   command / report│
//! │         │                   │                  │         │
//! │   [worker task]       [worker task]      [worker task]   │
//! │    handler.handle()    handler.handle()   handler.handle()│
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! A crash inside one worker task (handler panic) cannot corrupt the
//! pool or any other unit; the pool reclaims the dead handle and the
//! dispatcher requeues the in-flight message.

mod pool;
mod unit;

pub use pool::{ReapedWorker, WorkerPool};
pub use unit::{WorkerId, WorkerReport, WorkerState, WorkerUnit};
