use thiserror::Error;

/// Errors surfaced by the memory engine and its stores.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Malformed id, kind, or missing required field. Fails the whole call;
    /// nothing is written for any item in it.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A referenced node, triplet, or tree entry is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// The item is already stored. Idempotent no-op signal, not a failure.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The LLM merge call failed and no fallback applied.
    #[error("merge failed: {0}")]
    MergeFailed(String),

    /// An invariant check failed. Indicates a bug or a partial failure during
    /// a prior write; surface to an operator, do not repair silently.
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    /// Error from a storage backend, embedder, or HTTP call.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
