//! Hybrid memory retrieval core for a stateful companion agent.
//!
//! Long-term memory is stored twice: a SQLite FTS5 lexical index (the
//! system of record) and an ANN vector index over text embeddings. The
//! [`engine::HybridRetriever`] fuses both into one ranked list; the
//! [`engine::MemoryManager`] adds record lifecycle, importance heuristics,
//! a composite lexical ranking, and short-term conversational state.
//!
//! Layout follows a strict split: `atoms` holds pure types, errors, and
//! constants; `engine` holds everything that touches a file, a socket, or
//! a clock.

pub mod atoms;
pub mod engine;

pub use atoms::{
    EpisodeRecord, FactRecord, JsonMap, MemoryError, MemoryIndexItem, MemoryRecord,
    MemoryResult, MemoryType, RankedMemory, RetrievalResult, RetrievalSource,
    TimeWindow,
};
pub use engine::{
    ConversationTurn, CreateParams, EmbedderConfig, HybridRetriever, IndexTopology,
    LexicalConfig, LexicalIndex, ManagerConfig, MemoryManager, MemoryStats,
    RetrievalStrategy, RetrieveParams, RetrieverConfig, RetrieverStats, Role,
    SearchParams, TextEmbedder, VectorIndex, VectorIndexConfig, WorkingMemory,
    WorkingMemorySnapshot,
};
