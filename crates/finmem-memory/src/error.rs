use finmem_models::{MemoryId, Tier};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemoryError {
    /// A mutation would break an engine invariant. Always a logic bug; the
    /// mutation is refused rather than clamped.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Duplicate memory id {id} in {symbol}/{tier}")]
    DuplicateId {
        symbol: String,
        tier: Tier,
        id: MemoryId,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Symbol memory unavailable: {0}")]
    Unavailable(String),

    #[error("Unsupported snapshot version: {0}")]
    SnapshotVersion(u32),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
