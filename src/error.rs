//! Error type for tree construction, mutation and queries.

use std::collections::TryReserveError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IkdError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Ray direction has zero length")]
    ZeroDirection,
    #[error("Ray origin and length must be finite")]
    NonFiniteRay,
    #[error("Failed to reserve space for {requested} points: {source}")]
    Allocation {
        requested: usize,
        #[source]
        source: TryReserveError,
    },
    /// The link a background rebuild was about to replace no longer holds the
    /// subtree that was detached. The rebuilt subtree is discarded.
    #[error("Rebuilt subtree {expected} no longer matches its parent link")]
    SpliceMismatch { expected: u64 },
    #[error("Failed to start rebuild worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),
    #[error("Tree invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, IkdError>;

/// Reserve room for `additional` more elements, reporting failure instead of aborting.
pub(crate) fn try_reserve<T>(buf: &mut Vec<T>, additional: usize) -> Result<()> {
    buf.try_reserve(additional)
        .map_err(|source| IkdError::Allocation {
            requested: additional,
            source,
        })
}
