//! Tandem Sync Server Library
//!
//! The synchronization core of a multiplayer coop layer: interest-based
//! replication culling over a spatial index, a validating per-connection
//! packet protocol, and authoritative quest-stage replication.

pub mod config;
pub mod metrics;
pub mod net;
pub mod util;
pub mod world;
