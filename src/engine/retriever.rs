// ── Kioku Engine: Hybrid Retriever ─────────────────────────────────────────
// Fuses the lexical index and the vector index into one ranked result
// list. Every strategy funnels through the same fetch-and-fuse helper, so
// filtering, normalization, and ordering behave identically regardless of
// which indexes contributed candidates.
//
// Cross-index consistency is eventual: add_memory writes lexically first,
// and a failed vectorization leaves the record lexically retrievable with
// is_vectorized = false until a later re-embed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use log::{info, warn};
use parking_lot::RwLock;

use crate::atoms::constants::BM25_NORM_CEILING;
use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::retrieval::{
    RankedMemory, RetrievalResult, RetrievalSource, TimeWindow,
};
use crate::atoms::types::{parse_ts, MemoryRecord, MemoryType};
use crate::engine::embedding::TextEmbedder;
use crate::engine::lexical::LexicalIndex;
use crate::engine::vector::VectorIndex;

/// Queries at or below this many characters skip embedding under the
/// adaptive strategy; they are too short to carry semantic signal.
const ADAPTIVE_SHORT_QUERY_CHARS: usize = 5;

// ── Strategy ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetrievalStrategy {
    LexicalOnly,
    VectorOnly,
    #[default]
    Hybrid,
    /// Picks lexical-only or hybrid based on query length.
    Adaptive,
}

impl RetrievalStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalStrategy::LexicalOnly => "lexical_only",
            RetrievalStrategy::VectorOnly => "vector_only",
            RetrievalStrategy::Hybrid => "hybrid",
            RetrievalStrategy::Adaptive => "adaptive",
        }
    }
}

// ── Config ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    pub lexical_weight: f64,
    pub vector_weight: f64,
    pub recency_weight: f64,
    pub importance_weight: f64,
    /// Final result count.
    pub top_k: usize,
    /// Candidates requested from the lexical index before fusion.
    pub lexical_candidates: usize,
    /// Candidates requested from the vector index before fusion.
    pub vector_candidates: usize,
    /// Fused results below this score are dropped.
    pub min_score: f64,
    /// Linear recency window: a record this many days old scores 0.
    pub recency_decay_days: f64,
    /// Cosine-similarity floor applied inside the vector index.
    pub vector_threshold: f64,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            lexical_weight: 0.3,
            vector_weight: 0.5,
            recency_weight: 0.1,
            importance_weight: 0.1,
            top_k: 10,
            lexical_candidates: 30,
            vector_candidates: 30,
            min_score: 0.1,
            recency_decay_days: 30.0,
            vector_threshold: 0.0,
        }
    }
}

/// Point-in-time counters for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrieverStats {
    pub lexical_records: usize,
    pub indexed_vectors: usize,
    pub vector_dimension: usize,
    pub embedder_ready: bool,
}

/// Per-call retrieval knobs. `Default` gives the hybrid strategy with the
/// config's top_k and no filters.
#[derive(Debug, Clone, Default)]
pub struct RetrieveParams {
    pub strategy: RetrievalStrategy,
    pub top_k: Option<usize>,
    pub memory_types: Option<Vec<MemoryType>>,
    pub time_window: Option<TimeWindow>,
}

// ── Retriever ──────────────────────────────────────────────────────────────

/// Dual-index retrieval orchestrator.
pub struct HybridRetriever {
    config: RetrieverConfig,
    lexical: Arc<LexicalIndex>,
    vector: Arc<RwLock<VectorIndex>>,
    embedder: Arc<TextEmbedder>,
}

impl HybridRetriever {
    pub fn new(
        config: RetrieverConfig,
        lexical: Arc<LexicalIndex>,
        vector: Arc<RwLock<VectorIndex>>,
        embedder: Arc<TextEmbedder>,
    ) -> Self {
        Self {
            config,
            lexical,
            vector,
            embedder,
        }
    }

    /// Bring both indexes up. Embedder failure is survivable: the lexical
    /// path keeps working and vector operations degrade until a later
    /// initialize succeeds.
    pub async fn initialize(&self) -> MemoryResult<()> {
        self.lexical.initialize()?;
        self.vector.write().initialize()?;
        if let Err(e) = self.embedder.initialize().await {
            warn!("[retriever] embedder unavailable, vector search degraded: {e}");
        }
        info!("[retriever] initialized");
        Ok(())
    }

    pub fn stats(&self) -> MemoryResult<RetrieverStats> {
        let vector = self.vector.read();
        Ok(RetrieverStats {
            lexical_records: self.lexical.count()?,
            indexed_vectors: vector.len(),
            vector_dimension: vector.dimension(),
            embedder_ready: self.embedder.is_initialized(),
        })
    }

    // ── Retrieval ──────────────────────────────────────────────────────────

    /// Run one retrieval with the given strategy and filters. Zero results
    /// is a normal outcome; `Err` means a strategy could not execute at
    /// all (e.g. vector-only without an embedder).
    pub async fn retrieve(
        &self,
        query: &str,
        params: RetrieveParams,
    ) -> MemoryResult<RetrievalResult> {
        let started = Instant::now();
        let strategy = match params.strategy {
            RetrievalStrategy::Adaptive => {
                if query.chars().count() <= ADAPTIVE_SHORT_QUERY_CHARS {
                    RetrievalStrategy::LexicalOnly
                } else {
                    RetrievalStrategy::Hybrid
                }
            }
            other => other,
        };
        let mut envelope = match strategy {
            RetrievalStrategy::LexicalOnly => self.retrieve_lexical(query, &params).await?,
            RetrievalStrategy::VectorOnly => self.retrieve_vector(query, &params).await?,
            RetrievalStrategy::Hybrid => self.retrieve_hybrid(query, &params).await?,
            RetrievalStrategy::Adaptive => unreachable!("adaptive resolved above"),
        };
        envelope.strategy_used = strategy.as_str().to_string();
        envelope.retrieval_time_ms = started.elapsed().as_millis() as u64;
        Ok(envelope)
    }

    async fn retrieve_lexical(
        &self,
        query: &str,
        params: &RetrieveParams,
    ) -> MemoryResult<RetrievalResult> {
        let lexical_hits = self.lexical_candidates(query, params).await?;
        self.fuse(query, params, lexical_hits, Vec::new())
    }

    async fn retrieve_vector(
        &self,
        query: &str,
        params: &RetrieveParams,
    ) -> MemoryResult<RetrievalResult> {
        if !self.embedder.is_initialized() {
            return Err(MemoryError::retrieval(
                "vector_only",
                "embedder not initialized",
            ));
        }
        let query_vector = self
            .embedder
            .embed_one(query)
            .await
            .map_err(|e| MemoryError::retrieval("vector_only", e.to_string()))?;
        let vector_hits = self.vector_candidates(query_vector).await?;
        self.fuse(query, params, Vec::new(), vector_hits)
    }

    async fn retrieve_hybrid(
        &self,
        query: &str,
        params: &RetrieveParams,
    ) -> MemoryResult<RetrievalResult> {
        if !self.embedder.is_initialized() {
            warn!("[retriever] no embedder, hybrid degrades to lexical candidates");
            return self.retrieve_lexical(query, params).await;
        }
        // Lexical search and query embedding are independent; overlap them.
        let (lexical_hits, query_vector) = tokio::join!(
            self.lexical_candidates(query, params),
            self.embedder.embed_one(query),
        );
        let lexical_hits = lexical_hits?;
        let vector_hits = match query_vector {
            Ok(vector) => self.vector_candidates(vector).await?,
            Err(e) => {
                warn!("[retriever] query embed failed ({e}), fusing lexical only");
                Vec::new()
            }
        };
        self.fuse(query, params, lexical_hits, vector_hits)
    }

    async fn lexical_candidates(
        &self,
        query: &str,
        params: &RetrieveParams,
    ) -> MemoryResult<Vec<(String, f64)>> {
        let lexical = Arc::clone(&self.lexical);
        let query = query.to_string();
        let limit = self.config.lexical_candidates;
        let window = params.time_window.clone();
        let types = params.memory_types.clone();
        tokio::task::spawn_blocking(move || {
            lexical.search(&query, Some(limit), window.as_ref(), types.as_deref(), 0.0)
        })
        .await
        .map_err(|e| MemoryError::storage("search", e))?
    }

    async fn vector_candidates(&self, query_vector: Vec<f32>) -> MemoryResult<Vec<(String, f64)>> {
        let vector = Arc::clone(&self.vector);
        let limit = self.config.vector_candidates;
        let threshold = self.config.vector_threshold;
        tokio::task::spawn_blocking(move || {
            vector.read().search(&query_vector, Some(limit), threshold)
        })
        .await
        .map_err(|e| MemoryError::storage("search", e))?
    }

    // ── Fusion ─────────────────────────────────────────────────────────────

    /// Union the candidate sets, hydrate records, apply filters, and score:
    ///
    /// `final = w_lex·min(1, lex/15) + w_vec·(cos+1)/2 + w_rec·linear + w_imp·eff`
    ///
    /// The time window bounds BOTH candidate sets here: lexical hits were
    /// already pre-filtered in SQL, vector hits are filtered now, so a
    /// temporal query can never resurface out-of-window records through
    /// the vector side.
    fn fuse(
        &self,
        query: &str,
        params: &RetrieveParams,
        lexical_hits: Vec<(String, f64)>,
        vector_hits: Vec<(String, f64)>,
    ) -> MemoryResult<RetrievalResult> {
        let lexical_scores: HashMap<String, f64> = lexical_hits.into_iter().collect();
        let vector_scores: HashMap<String, f64> = vector_hits.into_iter().collect();
        let mut candidate_ids: Vec<&String> = lexical_scores.keys().collect();
        for id in vector_scores.keys() {
            if !lexical_scores.contains_key(id) {
                candidate_ids.push(id);
            }
        }
        let total_candidates = candidate_ids.len();
        let now = chrono::Utc::now();

        let mut ranked = Vec::with_capacity(candidate_ids.len());
        for id in candidate_ids {
            let Some(record) = self.lexical.get(id)? else {
                warn!("[retriever] candidate {id} has no record, skipping");
                continue;
            };
            if record.is_archived {
                continue;
            }
            if !record_passes_filters(&record, params) {
                continue;
            }
            let lexical_norm = lexical_scores
                .get(id)
                .map(|s| normalize_lexical(*s))
                .unwrap_or(0.0);
            let vector_norm = vector_scores
                .get(id)
                .map(|s| normalize_vector(*s))
                .unwrap_or(0.0);
            let recency = linear_recency(&record, now, self.config.recency_decay_days);
            let final_score = self.config.lexical_weight * lexical_norm
                + self.config.vector_weight * vector_norm
                + self.config.recency_weight * recency
                + self.config.importance_weight * record.effective_importance();
            let source = match (lexical_scores.contains_key(id), vector_scores.contains_key(id)) {
                (true, true) => RetrievalSource::Both,
                (true, false) => RetrievalSource::Lexical,
                _ => RetrievalSource::Vector,
            };
            ranked.push(RankedMemory {
                memory: record,
                final_score,
                // Semantic similarity only; lexical-only hits report 0.
                similarity_score: vector_norm,
                recency_score: recency,
                source,
            });
        }
        ranked.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
        ranked.retain(|r| r.final_score >= self.config.min_score);
        ranked.truncate(params.top_k.unwrap_or(self.config.top_k));

        Ok(RetrievalResult {
            query: query.to_string(),
            no_relevant_memory: ranked.is_empty(),
            memories: ranked,
            total_candidates,
            retrieval_time_ms: 0,
            strategy_used: String::new(),
        })
    }

    // ── Index maintenance ──────────────────────────────────────────────────

    /// Write a record to both indexes. The lexical write always lands
    /// first; if embedding or the vector write fails afterwards, the
    /// record stays lexically searchable and the error reports the
    /// vectorization failure.
    pub async fn add_memory(&self, record: &MemoryRecord) -> MemoryResult<()> {
        self.lexical.insert(record)?;
        if !self.embedder.is_initialized() {
            warn!(
                "[retriever] embedder not ready, {} stored without vector",
                record.id
            );
            return Err(MemoryError::vectorize(
                record.id.clone(),
                "embedder not initialized",
            ));
        }
        let vector = self
            .embedder
            .embed_one(&record.content)
            .await
            .map_err(|e| MemoryError::vectorize(record.id.clone(), e.to_string()))?;
        self.vector
            .write()
            .add_vectors(std::slice::from_ref(&record.id), &[vector])
            .map_err(|e| MemoryError::vectorize(record.id.clone(), e.to_string()))?;
        self.lexical.set_vectorized(&record.id, true)?;
        Ok(())
    }

    /// Remove a record from both indexes. Both removals are attempted even
    /// if the first fails; the call succeeds when either store dropped
    /// something.
    pub async fn remove_memory(&self, memory_id: &str) -> MemoryResult<bool> {
        let lexical_result = self.lexical.delete(memory_id);
        let vector_removed = self
            .vector
            .write()
            .remove_vectors(std::slice::from_ref(&memory_id.to_string()));
        match lexical_result {
            Ok(lexical_deleted) => {
                if lexical_deleted && vector_removed == 0 {
                    warn!("[retriever] {memory_id} had no vector to remove");
                }
                Ok(lexical_deleted || vector_removed > 0)
            }
            Err(e) if vector_removed > 0 => {
                warn!("[retriever] lexical delete failed for {memory_id} ({e}), vector side cleaned up");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Persist the vector index files.
    pub async fn save(&self) -> MemoryResult<()> {
        let vector = Arc::clone(&self.vector);
        tokio::task::spawn_blocking(move || vector.read().save())
            .await
            .map_err(|e| MemoryError::storage("save", e))?
    }
}

// ── Scoring helpers ────────────────────────────────────────────────────────

/// BM25 score → [0, 1] against the empirical ceiling.
fn normalize_lexical(score: f64) -> f64 {
    (score / BM25_NORM_CEILING).clamp(0.0, 1.0)
}

/// Cosine similarity [-1, 1] → [0, 1].
fn normalize_vector(score: f64) -> f64 {
    ((score + 1.0) / 2.0).clamp(0.0, 1.0)
}

/// Linear decay from 1 at age 0 to 0 at `decay_days`.
fn linear_recency(record: &MemoryRecord, now: chrono::DateTime<chrono::Utc>, decay_days: f64) -> f64 {
    let Some(created) = parse_ts(&record.created_at) else {
        return 0.0;
    };
    let age_days = (now - created).num_seconds().max(0) as f64 / 86_400.0;
    (1.0 - age_days / decay_days).max(0.0)
}

fn record_passes_filters(record: &MemoryRecord, params: &RetrieveParams) -> bool {
    if let Some(types) = &params.memory_types {
        if !types.is_empty() && !types.contains(&record.memory_type) {
            return false;
        }
    }
    if let Some(window) = &params.time_window {
        match parse_ts(&record.created_at) {
            Some(created) if window.contains(created) => {}
            _ => return false,
        }
    }
    true
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::MemoryType;
    use chrono::{Duration, Utc};

    #[test]
    fn lexical_normalization_caps_at_ceiling() {
        assert_eq!(normalize_lexical(0.0), 0.0);
        assert!((normalize_lexical(7.5) - 0.5).abs() < 1e-12);
        assert_eq!(normalize_lexical(15.0), 1.0);
        assert_eq!(normalize_lexical(100.0), 1.0);
        assert_eq!(normalize_lexical(-3.0), 0.0);
    }

    #[test]
    fn vector_normalization_maps_cosine_range() {
        assert_eq!(normalize_vector(-1.0), 0.0);
        assert_eq!(normalize_vector(0.0), 0.5);
        assert_eq!(normalize_vector(1.0), 1.0);
        assert_eq!(normalize_vector(2.0), 1.0);
    }

    #[test]
    fn linear_recency_hits_zero_at_decay_horizon() {
        let now = Utc::now();
        let mut record = MemoryRecord::new("x", MemoryType::Fact);
        record.created_at = now.to_rfc3339();
        assert!((linear_recency(&record, now, 30.0) - 1.0).abs() < 1e-6);
        record.created_at = (now - Duration::days(15)).to_rfc3339();
        assert!((linear_recency(&record, now, 30.0) - 0.5).abs() < 1e-3);
        record.created_at = (now - Duration::days(45)).to_rfc3339();
        assert_eq!(linear_recency(&record, now, 30.0), 0.0);
        record.created_at = "garbage".to_string();
        assert_eq!(linear_recency(&record, now, 30.0), 0.0);
    }

    #[test]
    fn type_filter_rejects_other_types() {
        let record = MemoryRecord::new("x", MemoryType::Episode);
        let params = RetrieveParams {
            memory_types: Some(vec![MemoryType::Fact]),
            ..Default::default()
        };
        assert!(!record_passes_filters(&record, &params));
        let open = RetrieveParams::default();
        assert!(record_passes_filters(&record, &open));
    }

    #[test]
    fn time_window_filter_bounds_created_at() {
        let mut record = MemoryRecord::new("x", MemoryType::Fact);
        record.created_at = (Utc::now() - Duration::days(5)).to_rfc3339();
        let recent_only = RetrieveParams {
            time_window: Some(TimeWindow::last_days(1)),
            ..Default::default()
        };
        assert!(!record_passes_filters(&record, &recent_only));
        let wide = RetrieveParams {
            time_window: Some(TimeWindow::last_days(30)),
            ..Default::default()
        };
        assert!(record_passes_filters(&record, &wide));
    }

    #[test]
    fn default_strategy_is_hybrid() {
        assert_eq!(RetrievalStrategy::default(), RetrievalStrategy::Hybrid);
        assert_eq!(RetrievalStrategy::Adaptive.as_str(), "adaptive");
    }
}
