// ── Kioku Engine: Memory Manager ───────────────────────────────────────────
// High-level facade over the lexical index and working memory: record
// creation with importance heuristics, quota enforcement, composite-scored
// search, fact/episode constructors, the prompt-facing memory index, and
// conversation passthrough.
//
// The manager's composite score is deliberately different from the hybrid
// retriever's fusion: it weighs lexical relevance against an exponential
// 7-day-half-life recency, decayed importance, and log-scaled access
// frequency.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::info;

use crate::atoms::constants::{
    BM25_NORM_CEILING, DEFAULT_IMPORTANCE, DEFAULT_SIMILARITY_THRESHOLD,
    HIGH_SALIENCE_KEYWORDS, INDEX_SIMILARITY_THRESHOLD, MANAGER_FREQUENCY_WEIGHT,
    MANAGER_IMPORTANCE_WEIGHT, MANAGER_LEXICAL_WEIGHT, MANAGER_RECENCY_WEIGHT,
    RECENCY_HALF_LIFE_DAYS, SALIENT_IMPORTANCE,
};
use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::retrieval::{
    RankedMemory, RetrievalResult, RetrievalSource, TimeWindow,
};
use crate::atoms::types::{
    parse_ts, EpisodeRecord, FactRecord, JsonMap, MemoryIndexItem, MemoryRecord,
    MemoryType,
};
use crate::engine::lexical::{LexicalConfig, LexicalIndex};
use crate::engine::working_memory::{ConversationTurn, Role, WorkingMemory};

const NOT_INITIALIZED: &str = "MemoryManager not initialized: call initialize() first";

// ── Config + params ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub db_path: String,
    pub max_conversation_turns: usize,
    /// Live-record ceiling enforced at creation time.
    pub max_memories: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/memory.db".to_string(),
            max_conversation_turns: 20,
            max_memories: 10_000,
        }
    }
}

/// Per-call search knobs.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub top_k: usize,
    pub memory_types: Option<Vec<MemoryType>>,
    /// Explicit window; when absent, one is derived from temporal keywords
    /// in the query.
    pub time_window: Option<TimeWindow>,
    pub min_importance: f64,
    /// Composite-score floor.
    pub similarity_threshold: f64,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            memory_types: None,
            time_window: None,
            min_importance: 0.0,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

/// Optional overrides at record creation.
#[derive(Debug, Clone, Default)]
pub struct CreateParams {
    /// Skips the keyword heuristic when set.
    pub importance: Option<f64>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<JsonMap>,
    /// Attribution, stored under the `source` metadata key.
    pub source: Option<String>,
    /// Session correlation id, stored under the `session_id` metadata key.
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryStats {
    pub total_memories: usize,
    pub conversation_turns: usize,
    pub initialized: bool,
}

// ── Manager ────────────────────────────────────────────────────────────────

/// Facade over long-term lexical memory and short-term working memory.
///
/// # Panics
///
/// Every operation except `initialize`, `close`, and `get_stats` panics if
/// called before `initialize()` succeeds.
pub struct MemoryManager {
    config: ManagerConfig,
    lexical: Arc<LexicalIndex>,
    working: WorkingMemory,
    initialized: bool,
}

impl MemoryManager {
    pub fn new(config: ManagerConfig) -> Self {
        let lexical = Arc::new(LexicalIndex::new(LexicalConfig {
            db_path: config.db_path.clone(),
            ..LexicalConfig::default()
        }));
        let working = WorkingMemory::new(config.max_conversation_turns);
        Self {
            config,
            lexical,
            working,
            initialized: false,
        }
    }

    /// Shared handle to the underlying lexical index, for composing a
    /// `HybridRetriever` over the same store.
    pub fn lexical_index(&self) -> Arc<LexicalIndex> {
        Arc::clone(&self.lexical)
    }

    pub async fn initialize(&mut self) -> MemoryResult<()> {
        if self.initialized {
            return Ok(());
        }
        self.lexical.initialize()?;
        self.initialized = true;
        info!("[manager] ready with store {}", self.config.db_path);
        Ok(())
    }

    pub async fn close(&mut self) {
        if self.initialized {
            self.lexical.close();
            self.initialized = false;
        }
    }

    fn ensure_initialized(&self) {
        assert!(self.initialized, "{NOT_INITIALIZED}");
    }

    // ── Creation ───────────────────────────────────────────────────────────

    /// Store a new memory. Importance falls back to the salience-keyword
    /// heuristic when not supplied. Fails with `QuotaExceeded` once the
    /// live-record ceiling is reached.
    pub fn create_memory(
        &self,
        content: impl Into<String>,
        memory_type: MemoryType,
        params: CreateParams,
    ) -> MemoryResult<MemoryRecord> {
        self.ensure_initialized();
        let content = content.into();
        let current = self.lexical.count()?;
        if current >= self.config.max_memories {
            return Err(MemoryError::QuotaExceeded {
                current,
                max_allowed: self.config.max_memories,
            });
        }
        let mut record = MemoryRecord::new(&content, memory_type);
        record.importance = params
            .importance
            .unwrap_or_else(|| evaluate_importance(&content));
        if let Some(tags) = params.tags {
            record.tags = tags;
        }
        if let Some(metadata) = params.metadata {
            record.metadata = metadata;
        }
        if let Some(source) = params.source {
            record
                .metadata
                .insert("source".into(), serde_json::json!(source));
        }
        if let Some(session_id) = params.session_id {
            record
                .metadata
                .insert("session_id".into(), serde_json::json!(session_id));
        }
        self.lexical.insert(&record)?;
        Ok(record)
    }

    /// Store a structured fact. The fact is mirrored into the main store
    /// as a fact-typed record sharing the fact's id, so lexical search and
    /// `search_facts` see the same entity.
    pub fn create_fact(
        &self,
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
        confidence: f64,
        source_memory_ids: Vec<String>,
    ) -> MemoryResult<FactRecord> {
        self.ensure_initialized();
        let mut fact = FactRecord::new(subject, predicate, object, confidence);
        fact.source_memory_ids = source_memory_ids;

        let mut record = fact.to_memory_record();
        record.importance = SALIENT_IMPORTANCE;
        record
            .metadata
            .insert("source".into(), serde_json::json!("fact_extraction"));
        self.lexical.insert(&record)?;
        Ok(fact)
    }

    /// Store an interaction episode. Importance scales with the magnitude
    /// of the affinity change: |Δ| ≥ 5 → 0.8, |Δ| ≥ 3 → 0.7, else 0.5.
    pub fn create_episode(
        &self,
        content: impl Into<String>,
        emotion_tag: impl Into<String>,
        affinity_change: i64,
        participants: Vec<String>,
    ) -> MemoryResult<EpisodeRecord> {
        self.ensure_initialized();
        let mut episode = EpisodeRecord::new(content, emotion_tag, affinity_change);
        episode.participants = participants;

        let mut record = episode.to_memory_record();
        record.importance = episode_importance(affinity_change);
        self.lexical.insert(&record)?;
        Ok(episode)
    }

    // ── Search ─────────────────────────────────────────────────────────────

    /// Composite-scored lexical search. A time window is derived from
    /// temporal keywords in the query when none is given explicitly.
    /// Candidate bookkeeping (`touch`) happens on the returned copies
    /// only; nothing is persisted until `expand_memory`.
    pub async fn search(
        &self,
        query: &str,
        params: SearchParams,
    ) -> MemoryResult<RetrievalResult> {
        self.ensure_initialized();
        let started = Instant::now();
        let window = params
            .time_window
            .clone()
            .or_else(|| TimeWindow::from_keyword(query));
        // Over-fetch so the threshold cut still leaves top_k survivors.
        let candidates = self.lexical.search(
            query,
            Some(params.top_k.saturating_mul(2).max(1)),
            window.as_ref(),
            params.memory_types.as_deref(),
            params.min_importance,
        )?;

        let now = Utc::now();
        let mut ranked = Vec::with_capacity(candidates.len());
        for (id, lexical_score) in &candidates {
            let Some(mut record) = self.lexical.get(id)? else {
                continue;
            };
            record.touch();
            let similarity_score = normalize_lexical(*lexical_score);
            let recency_score = exponential_recency(&record.created_at, now);
            let final_score = MANAGER_LEXICAL_WEIGHT * similarity_score
                + MANAGER_RECENCY_WEIGHT * recency_score
                + MANAGER_IMPORTANCE_WEIGHT * record.effective_importance()
                + MANAGER_FREQUENCY_WEIGHT * record.frequency_score();
            ranked.push(RankedMemory {
                memory: record,
                final_score,
                similarity_score,
                recency_score,
                source: RetrievalSource::Lexical,
            });
        }
        let total_candidates = ranked.len();
        ranked.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
        ranked.retain(|r| r.final_score >= params.similarity_threshold);
        ranked.truncate(params.top_k);

        Ok(RetrievalResult {
            query: query.to_string(),
            no_relevant_memory: ranked.is_empty(),
            memories: ranked,
            total_candidates,
            retrieval_time_ms: started.elapsed().as_millis() as u64,
            strategy_used: "lexical".to_string(),
        })
    }

    /// Look up structured facts by any combination of triple fragments.
    /// With no fragments at all the result is empty, never an error.
    pub async fn search_facts(
        &self,
        subject: Option<&str>,
        predicate: Option<&str>,
        object: Option<&str>,
    ) -> MemoryResult<Vec<FactRecord>> {
        self.ensure_initialized();
        let fragments: Vec<&str> = [subject, predicate, object]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect();
        if fragments.is_empty() {
            return Ok(Vec::new());
        }
        let query = fragments.join(" ");
        let envelope = self
            .search(
                &query,
                SearchParams {
                    top_k: 20,
                    memory_types: Some(vec![MemoryType::Fact]),
                    similarity_threshold: 0.0,
                    ..SearchParams::default()
                },
            )
            .await?;
        Ok(envelope
            .memories
            .iter()
            .filter_map(|ranked| fact_from_record(&ranked.memory))
            .collect())
    }

    /// Compact, loosely-filtered memory index for prompt injection.
    pub async fn get_memory_index(
        &self,
        query: &str,
        count: usize,
    ) -> MemoryResult<Vec<MemoryIndexItem>> {
        self.ensure_initialized();
        let envelope = self
            .search(
                query,
                SearchParams {
                    top_k: count,
                    similarity_threshold: INDEX_SIMILARITY_THRESHOLD,
                    ..SearchParams::default()
                },
            )
            .await?;
        let now = Utc::now();
        Ok(envelope
            .memories
            .iter()
            .map(|ranked| MemoryIndexItem::from_record(&ranked.memory, now))
            .collect())
    }

    /// Fetch the full record behind an index item and persist the access
    /// bookkeeping. Unknown ids yield `None`.
    pub async fn expand_memory(&self, memory_id: &str) -> MemoryResult<Option<MemoryRecord>> {
        self.ensure_initialized();
        let Some(mut record) = self.lexical.get(memory_id)? else {
            return Ok(None);
        };
        record.touch();
        self.lexical
            .record_access(&record.id, record.access_count, record.last_accessed.as_deref())?;
        Ok(Some(record))
    }

    // ── Conversation passthrough ───────────────────────────────────────────

    /// Append a turn. Unknown role strings are rejected.
    pub fn add_conversation_turn(
        &mut self,
        role: &str,
        content: impl Into<String>,
        metadata: JsonMap,
    ) -> MemoryResult<()> {
        self.ensure_initialized();
        let role = Role::from_str(role).map_err(|e| MemoryError::storage("add_turn", e))?;
        self.working.add_turn(role, content, metadata);
        Ok(())
    }

    pub fn get_conversation_history(&self, limit: Option<usize>) -> Vec<ConversationTurn> {
        self.ensure_initialized();
        self.working.history(limit).into_iter().cloned().collect()
    }

    pub fn clear_conversation(&mut self) {
        self.ensure_initialized();
        self.working.clear();
    }

    // ── Stats ──────────────────────────────────────────────────────────────

    pub fn get_stats(&self) -> MemoryResult<MemoryStats> {
        let total_memories = if self.initialized {
            self.lexical.count()?
        } else {
            0
        };
        Ok(MemoryStats {
            total_memories,
            conversation_turns: self.working.turn_count(),
            initialized: self.initialized,
        })
    }
}

// ── Scoring + heuristics ───────────────────────────────────────────────────

/// Salience-keyword heuristic: 0.7 when the content mentions anything from
/// the keyword list, 0.5 otherwise.
pub fn evaluate_importance(content: &str) -> f64 {
    if HIGH_SALIENCE_KEYWORDS.iter().any(|kw| content.contains(kw)) {
        SALIENT_IMPORTANCE
    } else {
        DEFAULT_IMPORTANCE
    }
}

fn episode_importance(affinity_change: i64) -> f64 {
    match affinity_change.unsigned_abs() {
        n if n >= 5 => 0.8,
        n if n >= 3 => 0.7,
        _ => 0.5,
    }
}

/// Exponential recency with a 7-day half-life: exp(-ln2 · age_days / 7).
/// Unparseable timestamps score 0.
pub fn exponential_recency(created_at: &str, now: DateTime<Utc>) -> f64 {
    let Some(created) = parse_ts(created_at) else {
        return 0.0;
    };
    let age_days = (now - created).num_seconds().max(0) as f64 / 86_400.0;
    (-std::f64::consts::LN_2 * age_days / RECENCY_HALF_LIFE_DAYS).exp()
}

/// Lexical score normalization for the composite formula. Substring-
/// fallback scores are stored importances already in [0, 1] and pass
/// through unchanged; anything larger is a BM25 rank scaled against the
/// empirical ceiling.
fn normalize_lexical(score: f64) -> f64 {
    if score <= 1.0 {
        score.max(0.0)
    } else {
        (score / BM25_NORM_CEILING).min(1.0)
    }
}

/// Rebuild a `FactRecord` from a mirrored fact record's metadata.
/// Records missing the triple keys yield `None`.
fn fact_from_record(record: &MemoryRecord) -> Option<FactRecord> {
    let get_str = |key: &str| {
        record
            .metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };
    let source_memory_ids = record
        .metadata
        .get("source_memory_ids")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Some(FactRecord {
        id: record.id.clone(),
        subject: get_str("subject")?,
        predicate: get_str("predicate")?,
        object: get_str("object")?,
        confidence: record
            .metadata
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        source_memory_ids,
        created_at: record.created_at.clone(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
