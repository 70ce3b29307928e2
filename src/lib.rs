//! Inventory announcement tracking for peer-to-peer nodes.
//!
//! Peers on a gossip network announce inventory items (typically
//! transactions) far more often than any node wants to download them. This
//! library keeps track of who announced what and answers one question:
//! *which peer should be asked for each item next, and when?* At most one
//! request is kept in flight per item, with preferred peers tried first.
//! Unanswered requests fall back to the remaining candidates, and the
//! selection order is randomized per process so that no peer can arrange
//! to always be the one asked.
//!
//! The tracker performs no IO and reads no clocks: callers feed it events
//! and timestamps, and poll [`RequestTracker::get_requestable`] whenever
//! they are ready to send requests. See the [`tracker`] module for the
//! full lifecycle.
#![deny(missing_docs, unsafe_code)]
pub mod collections;
pub mod priority;
pub mod time;
pub mod tracker;

#[cfg(test)]
mod model;

pub use priority::{Priority, PriorityOracle};
pub use time::{LocalDuration, LocalTime};
pub use tracker::{ItemId, PeerId, RequestTracker};
