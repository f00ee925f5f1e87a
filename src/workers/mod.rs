//! Backup workers and the pool that tracks them
//!
//! A worker performs one backup of one shard end to end. The
//! [`WorkerManager`] owns every running worker of the process.

mod backup;
mod manager;
mod transport;

pub use backup::*;
pub use manager::*;
pub use transport::*;

use thiserror::Error;

/// Failure inside a backup worker
///
/// These never escape a reconcile; they end up in the message of a
/// `Failed` backup record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Remote session could not be opened
    #[error("connect failed: {0}")]
    Connect(String),

    /// Remote command exited with an error
    #[error("command failed: {0}")]
    Command(String),

    /// Deadline exceeded
    #[error("timeout")]
    Timeout,

    /// Owning resource deleted while the backup was in flight
    #[error("canceled")]
    Canceled,

    /// Object storage upload failed
    #[error("transfer failed: {0}")]
    Transfer(String),
}
