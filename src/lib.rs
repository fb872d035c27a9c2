//! One-way incremental replication sender for time-series data files.
//!
//! A daemon that periodically scans data directories for newly flushed
//! immutable data files and for files deleted since the last run, ships
//! the delta plus the new suffix of the append-only schema log to a remote
//! receiver over a length-framed TCP protocol, and atomically promotes the
//! shipped file list to be the next cycle's baseline. Progress is
//! journaled so an interrupted run is reconciled on the next start.

pub mod baseline;
pub mod client;
pub mod config;
pub mod error;
pub mod identity;
pub mod inventory;
pub mod journal;
pub mod lock;
pub mod protocol;
pub mod sender;
pub mod shipper;

pub use error::{Result, SyncError};
