// ── Kioku Atoms: Error Types ───────────────────────────────────────────────
// Single canonical error enum for the memory core, built with `thiserror`.
//
// Design rules:
//   • Variants map one-to-one onto the failure classes of the retrieval
//     engine: lookup, strategy, vectorization, storage, quota.
//   • Malformed user queries are NOT errors: search paths recover locally
//     and report empty results instead (see LexicalIndex::search).
//   • Initialization-order misuse (calling an operation before
//     `initialize()`) is a programmer error and panics; it has no variant
//     here on purpose.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum MemoryError {
    /// Lookup by id found nothing.
    #[error("memory not found: {0}")]
    NotFound(String),

    /// A named retrieval strategy failed end-to-end.
    #[error("retrieval failed [{strategy}]: {message}")]
    Retrieval { strategy: String, message: String },

    /// Embedding a specific record (or the operation named in its place)
    /// failed. The lexical write, if any, is never rolled back.
    #[error("vectorize failed for {memory_id}: {reason}")]
    Vectorize { memory_id: String, reason: String },

    /// An index-level read or write operation failed.
    #[error("storage {operation} failed: {reason}")]
    Storage { operation: String, reason: String },

    /// The record-count ceiling was hit.
    #[error("memory quota exceeded: {current}/{max_allowed}")]
    QuotaExceeded { current: usize, max_allowed: usize },
}

// ── Convenience constructors ───────────────────────────────────────────────

impl MemoryError {
    /// Create a retrieval error with strategy name and message.
    pub fn retrieval(strategy: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Retrieval { strategy: strategy.into(), message: message.into() }
    }

    /// Create a vectorize error with memory id and reason.
    pub fn vectorize(memory_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Vectorize { memory_id: memory_id.into(), reason: reason.into() }
    }

    /// Create a storage error with operation name and reason.
    pub fn storage(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Storage { operation: operation.into(), reason: reason.to_string() }
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All memory-core operations return this type.
pub type MemoryResult<T> = Result<T, MemoryError>;
