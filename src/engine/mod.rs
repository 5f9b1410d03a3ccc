// ── Kioku Engine ───────────────────────────────────────────────────────────
// Working components: indexes, embedder, retriever, working memory, and
// the manager facade. Everything stateful lives here; pure types live in
// `atoms`.

pub mod embedding;
pub mod lexical;
pub mod manager;
pub mod retriever;
pub mod vector;
pub mod working_memory;

pub use embedding::{EmbedderConfig, TextEmbedder};
pub use lexical::{LexicalConfig, LexicalIndex};
pub use manager::{
    CreateParams, ManagerConfig, MemoryManager, MemoryStats, SearchParams,
};
pub use retriever::{
    HybridRetriever, RetrievalStrategy, RetrieveParams, RetrieverConfig,
    RetrieverStats,
};
pub use vector::{IndexTopology, VectorIndex, VectorIndexConfig};
pub use working_memory::{
    ConversationTurn, Role, WorkingMemory, WorkingMemorySnapshot,
};
