//! Routing error types

use mapstack_storage::StorageError;
use thiserror::Error;

/// Routing errors
#[derive(Error, Debug)]
pub enum RoutingError {
    /// Edge table at its maximum size
    #[error("edge table full ({0} edges)")]
    TableFull(usize),
    /// Router sink list at its maximum size
    #[error("too many sinks ({0})")]
    TooManySinks(usize),
    /// Edge fields out of range
    #[error("invalid edge: {0}")]
    InvalidEdge(String),
    /// Persisted edge table failed verification
    #[error("corrupt edge table: {0}")]
    Corrupt(String),
    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
