// ── Kioku Atoms: Retrieval Envelopes ───────────────────────────────────────
// Result-shape types shared by the retriever and the manager, plus the
// temporal keyword → TimeWindow mapping.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::atoms::constants::TEMPORAL_KEYWORDS;
use crate::atoms::types::MemoryRecord;

// ── Ranked results ─────────────────────────────────────────────────────────

/// Which index (or indexes) produced a ranked hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalSource {
    Lexical,
    Vector,
    Both,
}

/// One scored hit in a retrieval envelope. The component scores are kept
/// alongside the fused total so callers can explain a ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedMemory {
    pub memory: MemoryRecord,
    /// Fused relevance score. Comparable only within one envelope.
    pub final_score: f64,
    /// Normalized content-similarity component in [0, 1].
    pub similarity_score: f64,
    /// Recency component in [0, 1] under the caller's decay model.
    pub recency_score: f64,
    pub source: RetrievalSource,
}

/// The envelope every search operation returns. Zero results is a normal
/// outcome, never an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query: String,
    /// Sorted by final_score, descending.
    pub memories: Vec<RankedMemory>,
    /// True exactly when `memories` is empty.
    pub no_relevant_memory: bool,
    pub total_candidates: usize,
    pub retrieval_time_ms: u64,
    /// Name of the strategy that actually executed (adaptive reports the
    /// strategy it delegated to).
    pub strategy_used: String,
}

impl RetrievalResult {
    /// Empty envelope for a query that matched nothing.
    pub fn empty(query: impl Into<String>, strategy_used: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            memories: Vec::new(),
            no_relevant_memory: true,
            total_candidates: 0,
            retrieval_time_ms: 0,
            strategy_used: strategy_used.into(),
        }
    }

    pub fn has_results(&self) -> bool {
        !self.memories.is_empty()
    }

    /// Best hit, if any.
    pub fn top_memory(&self) -> Option<&RankedMemory> {
        self.memories.first()
    }
}

// ── Time windows ───────────────────────────────────────────────────────────

/// Half-open-ish created_at filter. `None` on either side means unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// The query keyword that produced this window, when derived.
    pub source_keyword: Option<String>,
}

impl TimeWindow {
    /// Window covering the last `hours` hours, ending now.
    pub fn last_hours(hours: i64) -> Self {
        let now = Utc::now();
        Self {
            start: Some(now - Duration::hours(hours)),
            end: Some(now),
            source_keyword: None,
        }
    }

    /// Window covering the last `days` days, ending now.
    pub fn last_days(days: i64) -> Self {
        Self::last_hours(days * 24)
    }

    /// Scan the query for a temporal keyword and build the matching window.
    /// The keyword table is ordered; the first keyword contained in the
    /// query wins, so 刚才 beats 之前 in "刚才说的之前的事".
    pub fn from_keyword(query: &str) -> Option<Self> {
        let now = Utc::now();
        for (keyword, start_hours_ago, end_hours_ago) in TEMPORAL_KEYWORDS {
            if query.contains(keyword) {
                return Some(Self {
                    start: Some(now - Duration::hours(*start_hours_ago)),
                    end: Some(now - Duration::hours(*end_hours_ago)),
                    source_keyword: Some((*keyword).to_string()),
                });
            }
        }
        None
    }

    /// Whether `instant` falls inside the window (inclusive bounds).
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        if let Some(start) = self.start {
            if instant < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if instant > end {
                return false;
            }
        }
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::types::MemoryType;

    #[test]
    fn keyword_window_for_just_now_spans_one_hour_to_now() {
        let before = Utc::now();
        let window = TimeWindow::from_keyword("刚才我们聊了什么").unwrap();
        let after = Utc::now();
        assert_eq!(window.source_keyword.as_deref(), Some("刚才"));
        let start = window.start.unwrap();
        let end = window.end.unwrap();
        assert!(start >= before - Duration::hours(1));
        assert!(start <= after - Duration::hours(1) + Duration::seconds(1));
        assert!(end >= before && end <= after);
    }

    #[test]
    fn keyword_window_for_yesterday_excludes_today() {
        let window = TimeWindow::from_keyword("昨天发生了什么").unwrap();
        let now = Utc::now();
        assert!(window.end.unwrap() <= now - Duration::hours(24) + Duration::seconds(1));
        assert!(window.start.unwrap() >= now - Duration::hours(48) - Duration::seconds(1));
        assert!(!window.contains(now));
        assert!(window.contains(now - Duration::hours(36)));
    }

    #[test]
    fn first_matching_keyword_wins() {
        let window = TimeWindow::from_keyword("刚才说的之前的事").unwrap();
        assert_eq!(window.source_keyword.as_deref(), Some("刚才"));
    }

    #[test]
    fn no_keyword_means_no_window() {
        assert!(TimeWindow::from_keyword("咖啡的做法").is_none());
    }

    #[test]
    fn unbounded_sides_accept_everything() {
        let window = TimeWindow {
            start: None,
            end: None,
            source_keyword: None,
        };
        assert!(window.contains(Utc::now()));
        assert!(window.contains(Utc::now() - Duration::days(10_000)));
    }

    #[test]
    fn empty_envelope_has_no_results() {
        let envelope = RetrievalResult::empty("q", "lexical_only");
        assert!(!envelope.has_results());
        assert!(envelope.no_relevant_memory);
        assert!(envelope.top_memory().is_none());
        assert_eq!(envelope.strategy_used, "lexical_only");
    }

    #[test]
    fn top_memory_is_the_first_entry() {
        let best = MemoryRecord::new("best", MemoryType::Fact);
        let envelope = RetrievalResult {
            query: "q".to_string(),
            memories: vec![
                RankedMemory {
                    memory: best.clone(),
                    final_score: 0.9,
                    similarity_score: 0.8,
                    recency_score: 1.0,
                    source: RetrievalSource::Both,
                },
                RankedMemory {
                    memory: MemoryRecord::new("second", MemoryType::Fact),
                    final_score: 0.4,
                    similarity_score: 0.3,
                    recency_score: 0.9,
                    source: RetrievalSource::Lexical,
                },
            ],
            no_relevant_memory: false,
            total_candidates: 2,
            retrieval_time_ms: 1,
            strategy_used: "hybrid".to_string(),
        };
        assert_eq!(envelope.top_memory().unwrap().memory.id, best.id);
    }
}
