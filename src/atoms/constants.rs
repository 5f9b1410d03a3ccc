// ── Kioku Atoms: Constants ─────────────────────────────────────────────────
// All named constants for the memory core. Scoring weights and keyword
// tables are load-bearing: retrieval ranking changes whenever they do.

// ── Importance heuristics ──────────────────────────────────────────────────
// Content containing any of these keywords is auto-assigned importance 0.7
// at creation time; everything else defaults to 0.5.
pub const HIGH_SALIENCE_KEYWORDS: &[&str] = &[
    "生日", "重要", "记住", "喜欢", "讨厌", "爱", "恨", "约定", "承诺",
];

/// Default importance when no heuristic keyword matches.
pub const DEFAULT_IMPORTANCE: f64 = 0.5;
/// Importance assigned when a high-salience keyword is present.
pub const SALIENT_IMPORTANCE: f64 = 0.7;
/// Importance at or above which a memory is flagged high-priority in the
/// prompt-facing memory index.
pub const HIGH_PRIORITY_IMPORTANCE: f64 = 0.7;

// ── Temporal keyword table ─────────────────────────────────────────────────
// (keyword, window start in hours before now, window end in hours before now).
// Scanned in order; the first keyword contained in the query wins.
// This table is part of the external contract: do not reorder or retune.
pub const TEMPORAL_KEYWORDS: &[(&str, i64, i64)] = &[
    ("刚才", 1, 0),
    ("刚刚", 1, 0),
    ("今天", 24, 0),
    ("昨天", 48, 24),
    ("最近", 72, 0),
    ("这几天", 72, 0),
    ("上次", 168, 0),
    ("之前", 168, 0),
    ("以前", 720, 0),
    ("很久", 720, 0),
];

// ── Manager composite scoring ──────────────────────────────────────────────
// final = 0.4·lexical + 0.3·recency + 0.2·effective_importance + 0.1·frequency
pub const MANAGER_LEXICAL_WEIGHT: f64 = 0.4;
pub const MANAGER_RECENCY_WEIGHT: f64 = 0.3;
pub const MANAGER_IMPORTANCE_WEIGHT: f64 = 0.2;
pub const MANAGER_FREQUENCY_WEIGHT: f64 = 0.1;

/// Half-life of the manager's exponential recency model, in days.
/// A 7-day-old memory scores exactly 0.5.
pub const RECENCY_HALF_LIFE_DAYS: f64 = 7.0;

/// Access count at which the log-scaled frequency term saturates at 1.0.
pub const FREQUENCY_SATURATION_COUNT: f64 = 10.0;

/// Default gate below which a fused result is treated as irrelevant.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.65;
/// Looser gate used for the prompt-facing memory index.
pub const INDEX_SIMILARITY_THRESHOLD: f64 = 0.3;

// ── Hybrid fusion normalization ────────────────────────────────────────────
/// Empirical BM25 score ceiling; lexical scores are divided by this and
/// clamped to 1.0 before fusion. BM25 values above it are rare in practice.
pub const BM25_NORM_CEILING: f64 = 15.0;
