pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod index;
pub mod symbol;
pub mod tier;

pub use checkpoint::SqliteCheckpointStore;
pub use engine::{validate_config, EngineSnapshot, IndexFactory, MemoryEngine, SNAPSHOT_VERSION};
pub use error::MemoryError;
pub use index::{cosine_similarity, FlatIndex, IndexMatch, IndexPayload, Partition, VectorIndex};
pub use symbol::{ScoredMemory, SweepReport, SymbolMemory, SymbolSnapshot};
pub use tier::{MemoryTier, TierSnapshot};
