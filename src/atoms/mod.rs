// ── Kioku Atoms ────────────────────────────────────────────────────────────
// Pure types, errors, and constants. Nothing in this tree performs I/O or
// depends on the engine layer.

pub mod constants;
pub mod error;
pub mod retrieval;
pub mod types;

pub use error::{MemoryError, MemoryResult};
pub use retrieval::{RankedMemory, RetrievalResult, RetrievalSource, TimeWindow};
pub use types::{
    EpisodeRecord, FactRecord, JsonMap, MemoryIndexItem, MemoryRecord, MemoryType,
};
