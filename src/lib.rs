//! Netchain - a chained tunnel engine
//!
//! # Architecture (Chain of Stages)
//!
//! ```text
//! TcpListener → MuxClient → HalfDuplexClient → TcpConnector
//!                                                    │
//! TcpConnector ← MuxServer ← HalfDuplexServer ← TcpListener
//! ```
//!
//! ## Core Principles
//!
//! - A chain is a fixed list of stages built from configuration
//! - A line is one flow through a chain, owned by exactly one worker
//! - Events travel upstream (towards the tail) or downstream (towards the head)
//! - Stages keep per-line state in the line's slot for their position
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Address, RoutingContext
//! ├── buffer/          # Pooled buffers and the reassembly stream
//! ├── worker/          # Worker threads: deferred tasks, timers, mailboxes
//! ├── tunnel/          # Tunnel trait, Hop, Chain, Line, pause state
//! ├── mux/             # Many child lines over one parent line
//! ├── halfduplex/      # One line over an upload and a download leg
//! ├── adapter/         # TCP listener and connector stages
//! └── app/             # Runtime, metrics, stats API
//! ```

// Core types
pub mod common;
pub mod error;

// Engine
pub mod buffer;
pub mod worker;
pub mod tunnel;

// Stages
pub mod mux;
pub mod halfduplex;
pub mod adapter;

// Application
pub mod app;
pub mod config;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use common::{Address, RoutingContext};
pub use error::{Error, Result};
pub use config::Config;

// Architecture re-exports
pub use app::Runtime;
pub use tunnel::{Chain, Hop, Line, Tunnel};
pub use worker::{Mailboxes, Worker, WorkerLoop};
