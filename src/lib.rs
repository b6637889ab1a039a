//! Kafka client runtime multiplexing many logical consumers and producers
//! over a small pool of persistent broker connections.
//!
//! Features:
//!
//! - Request bundling: per-partition fetches and produces coalesce into one
//!   broker RPC under a min-count / max-wait policy
//! - Preallocated buffer rings per partition, recycled between free and
//!   filled states, with back-pressure on both paths
//! - Transparent recovery: leader migrations and dead connections re-home
//!   the affected workers after a metadata refresh, with no user-visible
//!   error and no lost or duplicated offsets
//! - Manual offset management with `-1` (latest) / `-2` (earliest)
//!   starting sentinels
//!
//! Consumer groups, broker-side offset commits and TLS/SASL are out of
//! scope; delivery is at-least-once per partition.

/// Client handle: metadata cache, connection pool, worker registry and the
/// connection-manager recovery task.
pub mod client;

/// Configuration surface for the client and its workers.
pub mod config;

/// Consumer façade over a partition queue.
pub mod consumer;
pub mod error;

/// Producer façade over a partition queue.
pub mod producer;

mod buffer;
mod bundler;
mod connection;
mod metadata;
mod queue;

pub use client::Client;
pub use config::Config;
pub use consumer::{Consumer, Message};
pub use error::{Error, Result};
pub use producer::Producer;

// Wire-level types that are part of the public surface.
pub use kafka_mux_wire::{Compression, OFFSET_EARLIEST, OFFSET_LATEST};
