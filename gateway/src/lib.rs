//! The query routing gateway of a sharded, MySQL-compatible database.
//!
//! Clients send SQL to a stateless proxy layer; this crate picks, for every
//! individual query, a healthy backend tablet hosting the required shard and
//! role, executes the query there with bounded retries, and transparently
//! buffers in-flight writes across primary failovers.
//!
//! # Architecture
//!
//! ```text
//!   topology server ──> CellTabletsWatcher (one per cell)
//!                              │ add / replace / remove
//!                              v
//!                         HealthCheck ──(streaming health RPC per tablet)──> tablets
//!                              │ HealthEvent
//!                              v
//!                    TabletStatsCache ──> Buffer (primary events)
//!                              │                │
//!                     get_healthy(target)   wait_for_failover_end
//!                              └───────┬────────┘
//!                                      v
//!                         TabletGateway::execute
//! ```
//!
//! The gateway owns the health check; the health check publishes into the
//! cache and buffer through an injected listener; no component holds a
//! reference to its owner.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::dbg_macro,
    clippy::explicit_iter_loop,
    clippy::todo,
    clippy::use_self,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs
)]

pub mod buffer;
pub mod cache;
pub mod config;
pub mod error;
pub mod gateway;
pub mod healthcheck;
pub mod status;
pub mod topo;
pub mod types;

pub use config::{ConfigError, GatewayConfig};
pub use error::{ActionError, GatewayError};
pub use gateway::TabletGateway;
pub use types::{TabletAlias, TabletRecord, TabletRole, Target};

/// Work around the unused_crate_dependencies false positives for test deps.
#[cfg(test)]
use assert_matches as _;
