// ── Kioku Atoms: Memory Record Types ───────────────────────────────────────
// Pure data types for the memory core. No I/O, no engine imports.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::atoms::constants::{
    FREQUENCY_SATURATION_COUNT, HIGH_PRIORITY_IMPORTANCE,
};

/// JSON object map used for tags metadata and the context scratchpad.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

// ── Timestamps ─────────────────────────────────────────────────────────────

/// Current UTC time as an RFC 3339 string with microsecond precision.
/// All record timestamps are stored in this format.
pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp. Accepts any RFC 3339 string; returns `None`
/// for malformed input so scoring paths can degrade instead of erroring.
pub fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Relative-time label for prompt surfaces: 刚刚 / N分钟前 / N小时前 /
/// N天前 / N个月前 / N年前.
pub fn format_time_ago(ts: &str, now: DateTime<Utc>) -> String {
    let Some(then) = parse_ts(ts) else {
        return "刚刚".to_string();
    };
    let secs = (now - then).num_seconds().max(0);
    if secs < 60 {
        "刚刚".to_string()
    } else if secs < 3600 {
        format!("{}分钟前", secs / 60)
    } else if secs < 86_400 {
        format!("{}小时前", secs / 3600)
    } else if secs < 30 * 86_400 {
        format!("{}天前", secs / 86_400)
    } else if secs < 365 * 86_400 {
        format!("{}个月前", secs / (30 * 86_400))
    } else {
        format!("{}年前", secs / (365 * 86_400))
    }
}

// ── Memory type ────────────────────────────────────────────────────────────

/// Category of a memory record. Serialized lowercase everywhere (storage,
/// wire, filters).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    /// Stable knowledge about the user (preferences, attributes).
    Fact,
    /// A dated interaction event.
    Episode,
    /// A subject–predicate–object assertion mirrored from a `FactRecord`.
    Relation,
    /// A model-generated summary or insight.
    Reflection,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Fact => "fact",
            MemoryType::Episode => "episode",
            MemoryType::Relation => "relation",
            MemoryType::Reflection => "reflection",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fact" => Ok(MemoryType::Fact),
            "episode" => Ok(MemoryType::Episode),
            "relation" => Ok(MemoryType::Relation),
            "reflection" => Ok(MemoryType::Reflection),
            other => Err(format!("unknown memory type: {other}")),
        }
    }
}

// ── Memory record ──────────────────────────────────────────────────────────

/// The canonical unit of long-term memory. Every field is public; the
/// engine layers treat this as a plain row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// UUID v4, assigned at creation.
    pub id: String,
    pub content: String,
    pub memory_type: MemoryType,
    /// Intrinsic importance in [0, 1].
    pub importance: f64,
    /// RFC 3339 creation timestamp. Immutable after creation.
    pub created_at: String,
    /// RFC 3339 timestamp of the last content-level change.
    pub updated_at: String,
    /// RFC 3339 timestamp of the most recent retrieval. `None` until the
    /// record is first touched.
    pub last_accessed: Option<String>,
    /// How many times retrieval has surfaced this record.
    pub access_count: u64,
    /// Exponential decay factor applied to importance, in [0, 1].
    pub decay_factor: f64,
    /// Whether the record currently has a vector in the ANN index.
    pub is_vectorized: bool,
    /// Archived records are invisible to every search path.
    pub is_archived: bool,
    /// Set when a later memory contradicts this one.
    pub conflict_flag: bool,
    pub tags: Vec<String>,
    /// Open key-value bag for type-specific fields and attribution
    /// ("source", "session_id", a fact's triple, ...).
    pub metadata: JsonMap,
}

impl MemoryRecord {
    /// Build a fresh record with generated id and current timestamps.
    pub fn new(content: impl Into<String>, memory_type: MemoryType) -> Self {
        let ts = now_ts();
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            memory_type,
            importance: crate::atoms::constants::DEFAULT_IMPORTANCE,
            created_at: ts.clone(),
            updated_at: ts,
            last_accessed: None,
            access_count: 0,
            decay_factor: 1.0,
            is_vectorized: false,
            is_archived: false,
            conflict_flag: false,
            tags: Vec::new(),
            metadata: JsonMap::new(),
        }
    }

    /// Importance after decay: `importance * decay_factor`.
    pub fn effective_importance(&self) -> f64 {
        self.importance * self.decay_factor
    }

    /// Record one retrieval hit: bump the counter and refresh
    /// `last_accessed`. The single bookkeeping mutation: callers decide
    /// whether to persist it.
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Some(now_ts());
    }

    /// Log-scaled access frequency in [0, 1]: ln(1 + n) / ln(11).
    /// Saturates at 10 accesses; early hits move the needle most.
    pub fn frequency_score(&self) -> f64 {
        let n = self.access_count as f64;
        ((1.0 + n).ln() / (1.0 + FREQUENCY_SATURATION_COUNT).ln()).min(1.0)
    }
}

// ── Fact record ────────────────────────────────────────────────────────────

/// A structured subject–predicate–object assertion. Facts are mirrored
/// into the main store as fact-typed records that share the fact's id, so
/// lexical search finds them alongside free-text memories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
    pub id: String,
    pub subject: String,
    pub predicate: String,
    pub object: String,
    /// Extraction confidence in [0, 1].
    pub confidence: f64,
    /// Ids of the memories this fact was extracted from.
    pub source_memory_ids: Vec<String>,
    pub created_at: String,
}

impl FactRecord {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            confidence,
            source_memory_ids: Vec::new(),
            created_at: now_ts(),
        }
    }

    /// `(subject, predicate, object)` view.
    pub fn to_triple(&self) -> (&str, &str, &str) {
        (&self.subject, &self.predicate, &self.object)
    }

    /// Searchable text form: plain concatenation, no separator tokens, so
    /// the FTS tokenizer sees it the way users phrase it.
    pub fn to_content(&self) -> String {
        format!("{}{}{}", self.subject, self.predicate, self.object)
    }

    /// Mirrored memory record sharing this fact's id, with the structured
    /// fields packed into metadata. Importance is left at the default for
    /// the caller to assign.
    pub fn to_memory_record(&self) -> MemoryRecord {
        let mut record = MemoryRecord::new(self.to_content(), MemoryType::Fact);
        record.id = self.id.clone();
        record.created_at = self.created_at.clone();
        record.updated_at = self.created_at.clone();
        record
            .metadata
            .insert("subject".into(), serde_json::json!(self.subject));
        record
            .metadata
            .insert("predicate".into(), serde_json::json!(self.predicate));
        record
            .metadata
            .insert("object".into(), serde_json::json!(self.object));
        record
            .metadata
            .insert("confidence".into(), serde_json::json!(self.confidence));
        record.metadata.insert(
            "source_memory_ids".into(),
            serde_json::json!(self.source_memory_ids),
        );
        record
    }
}

// ── Episode record ─────────────────────────────────────────────────────────

/// A dated interaction event with emotional annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub id: String,
    pub content: String,
    /// Free-form emotion label ("开心", "难过", ...).
    pub emotion_tag: String,
    /// Signed affinity delta the episode caused.
    pub affinity_change: i64,
    pub participants: Vec<String>,
    pub created_at: String,
}

impl EpisodeRecord {
    pub fn new(
        content: impl Into<String>,
        emotion_tag: impl Into<String>,
        affinity_change: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            content: content.into(),
            emotion_tag: emotion_tag.into(),
            affinity_change,
            participants: Vec::new(),
            created_at: now_ts(),
        }
    }

    /// Mirrored memory record sharing this episode's id; same contract as
    /// `FactRecord::to_memory_record`.
    pub fn to_memory_record(&self) -> MemoryRecord {
        let mut record = MemoryRecord::new(&self.content, MemoryType::Episode);
        record.id = self.id.clone();
        record.created_at = self.created_at.clone();
        record.updated_at = self.created_at.clone();
        record
            .metadata
            .insert("emotion_tag".into(), serde_json::json!(self.emotion_tag));
        record.metadata.insert(
            "affinity_change".into(),
            serde_json::json!(self.affinity_change),
        );
        record.metadata.insert(
            "participants".into(),
            serde_json::json!(self.participants),
        );
        record
    }
}

// ── Memory index item ──────────────────────────────────────────────────────

/// Compact projection of a record for prompt injection. The formatted line
/// is `#{short_id} [{time_ago}] {summary} (重要度{:.1})`, with a trailing
/// ` ⭐` for high-priority items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryIndexItem {
    /// First 8 characters of the record id.
    pub short_id: String,
    /// Content capped at 20 characters, ellipsis included when cut.
    pub summary: String,
    pub time_ago: String,
    /// Effective (decayed) importance; the priority flag uses the raw value.
    pub importance: f64,
    pub high_priority: bool,
}

impl MemoryIndexItem {
    /// Project a record. Truncation counts characters, never bytes, so CJK
    /// content cannot split a code point.
    pub fn from_record(record: &MemoryRecord, now: DateTime<Utc>) -> Self {
        let short_id: String = record.id.chars().take(8).collect();
        let summary = if record.content.chars().count() > 20 {
            let head: String = record.content.chars().take(19).collect();
            format!("{head}…")
        } else {
            record.content.clone()
        };
        Self {
            short_id,
            summary,
            time_ago: format_time_ago(&record.created_at, now),
            importance: record.effective_importance(),
            high_priority: record.importance >= HIGH_PRIORITY_IMPORTANCE,
        }
    }

    /// One prompt line for this item.
    pub fn format_for_prompt(&self) -> String {
        let star = if self.high_priority { " ⭐" } else { "" };
        format!(
            "#{} [{}] {} (重要度{:.1}){}",
            self.short_id, self.time_ago, self.summary, self.importance, star
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn memory_type_round_trips_lowercase() {
        for (ty, s) in [
            (MemoryType::Fact, "fact"),
            (MemoryType::Episode, "episode"),
            (MemoryType::Relation, "relation"),
            (MemoryType::Reflection, "reflection"),
        ] {
            assert_eq!(ty.as_str(), s);
            assert_eq!(s.parse::<MemoryType>().unwrap(), ty);
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json, format!("\"{s}\""));
        }
        assert!("Fact".parse::<MemoryType>().is_err());
    }

    #[test]
    fn record_round_trips_through_serde() {
        let mut record = MemoryRecord::new("喜欢喝咖啡", MemoryType::Fact);
        record.tags = vec!["preference".to_string()];
        record
            .metadata
            .insert("origin".to_string(), serde_json::json!("test"));
        let json = serde_json::to_string(&record).unwrap();
        let back: MemoryRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn touch_bumps_count_and_refreshes_access_time() {
        let mut record = MemoryRecord::new("x", MemoryType::Episode);
        assert!(record.last_accessed.is_none());
        record.touch();
        record.touch();
        assert_eq!(record.access_count, 2);
        assert!(record.last_accessed.is_some());
    }

    #[test]
    fn frequency_score_is_log_scaled_and_saturates() {
        let mut record = MemoryRecord::new("x", MemoryType::Fact);
        assert_eq!(record.frequency_score(), 0.0);
        record.access_count = 10;
        assert!((record.frequency_score() - 1.0).abs() < 1e-9);
        record.access_count = 1000;
        assert_eq!(record.frequency_score(), 1.0);
        record.access_count = 1;
        let one = record.frequency_score();
        record.access_count = 2;
        let two = record.frequency_score();
        assert!(one > 0.0 && two > one && two < 1.0);
    }

    #[test]
    fn effective_importance_applies_decay() {
        let mut record = MemoryRecord::new("x", MemoryType::Fact);
        record.importance = 0.8;
        record.decay_factor = 0.5;
        assert!((record.effective_importance() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn fact_content_is_plain_concatenation() {
        let fact = FactRecord::new("主人", "喜欢", "咖啡", 0.9);
        assert_eq!(fact.to_content(), "主人喜欢咖啡");
        assert_eq!(fact.to_triple(), ("主人", "喜欢", "咖啡"));
    }

    #[test]
    fn episode_mirror_shares_id_and_packs_metadata() {
        let mut episode = EpisodeRecord::new("一起看了日落", "温馨", 4);
        episode.participants = vec!["主人".to_string()];
        let record = episode.to_memory_record();
        assert_eq!(record.id, episode.id);
        assert_eq!(record.memory_type, MemoryType::Episode);
        assert_eq!(record.created_at, episode.created_at);
        assert_eq!(
            record.metadata.get("emotion_tag").and_then(|v| v.as_str()),
            Some("温馨")
        );
        assert_eq!(
            record.metadata.get("affinity_change").and_then(|v| v.as_i64()),
            Some(4)
        );
    }

    #[test]
    fn index_item_truncates_on_char_boundaries() {
        let mut record =
            MemoryRecord::new("一二三四五六七八九十一二三四五六七八九十多余", MemoryType::Fact);
        record.importance = 0.8;
        let item = MemoryIndexItem::from_record(&record, Utc::now());
        assert_eq!(item.summary.chars().count(), 20); // 19 + ellipsis
        assert_eq!(item.summary, "一二三四五六七八九十一二三四五六七八九…");
        assert_eq!(item.short_id.chars().count(), 8);
        assert!(item.high_priority);
        let line = item.format_for_prompt();
        assert!(line.starts_with(&format!("#{}", item.short_id)));
        assert!(line.contains("重要度0.8"));
        assert!(line.ends_with('⭐'));
    }

    #[test]
    fn index_item_reports_decayed_importance_but_flags_on_raw() {
        let mut record = MemoryRecord::new("旧的重要约定", MemoryType::Fact);
        record.importance = 0.8;
        record.decay_factor = 0.5;
        let item = MemoryIndexItem::from_record(&record, Utc::now());
        assert!((item.importance - 0.4).abs() < 1e-12);
        assert!(item.high_priority);
        assert!(item.format_for_prompt().contains("重要度0.4"));
    }

    #[test]
    fn short_content_is_not_truncated() {
        let record = MemoryRecord::new("短内容", MemoryType::Fact);
        let item = MemoryIndexItem::from_record(&record, Utc::now());
        assert_eq!(item.summary, "短内容");
        assert!(!item.high_priority);
        assert!(!item.format_for_prompt().contains('⭐'));
    }

    #[test]
    fn time_ago_buckets() {
        let now = Utc::now();
        let cases = [
            (Duration::seconds(10), "刚刚".to_string()),
            (Duration::minutes(5), "5分钟前".to_string()),
            (Duration::hours(3), "3小时前".to_string()),
            (Duration::days(4), "4天前".to_string()),
            (Duration::days(65), "2个月前".to_string()),
            (Duration::days(400), "1年前".to_string()),
        ];
        for (ago, expect) in cases {
            let ts = (now - ago).to_rfc3339_opts(SecondsFormat::Micros, true);
            assert_eq!(format_time_ago(&ts, now), expect);
        }
        assert_eq!(format_time_ago("not-a-timestamp", now), "刚刚");
    }
}
