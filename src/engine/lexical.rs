// ── Kioku Engine: Lexical Index ────────────────────────────────────────────
// SQLite-backed lexical store. The `memories` table is the system of record
// for every field of a MemoryRecord; a plain FTS5 table with an UNINDEXED id
// column carries the searchable text and is kept in sync in the same
// transaction. BM25 ranks come back negated so that higher is always better
// at the call sites.

use std::sync::OnceLock;

use log::{info, warn};
use parking_lot::Mutex;
use regex::Regex;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection};

use crate::atoms::error::{MemoryError, MemoryResult};
use crate::atoms::retrieval::TimeWindow;
use crate::atoms::types::{JsonMap, MemoryRecord, MemoryType};

const NOT_INITIALIZED: &str = "LexicalIndex not initialized: call initialize() first";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id              TEXT PRIMARY KEY,
    content         TEXT NOT NULL,
    memory_type     TEXT NOT NULL,
    importance      REAL NOT NULL DEFAULT 0.5,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    last_accessed   TEXT,
    access_count    INTEGER NOT NULL DEFAULT 0,
    decay_factor    REAL NOT NULL DEFAULT 1.0,
    is_vectorized   INTEGER NOT NULL DEFAULT 0,
    is_archived     INTEGER NOT NULL DEFAULT 0,
    conflict_flag   INTEGER NOT NULL DEFAULT 0,
    tags            TEXT NOT NULL DEFAULT '[]',
    metadata        TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_memories_type ON memories(memory_type);
CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at);
CREATE INDEX IF NOT EXISTS idx_memories_archived ON memories(is_archived);

CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    memory_id UNINDEXED,
    content,
    tokenize = 'unicode61'
);
"#;

const SELECT_COLUMNS: &str = "id, content, memory_type, importance, created_at, \
     updated_at, last_accessed, access_count, decay_factor, is_vectorized, \
     is_archived, conflict_flag, tags, metadata";

// ── Config ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LexicalConfig {
    /// SQLite database file. Parent directories are created on initialize.
    pub db_path: String,
    /// Default candidate count when the caller passes no limit.
    pub top_k: usize,
}

impl Default for LexicalConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/memory.db".to_string(),
            top_k: 15,
        }
    }
}

// ── Index ──────────────────────────────────────────────────────────────────

/// Lexical full-text index over memory records.
///
/// Thread-safe: the single connection sits behind a mutex, so `&self`
/// methods can be called from blocking worker threads.
///
/// # Panics
///
/// Every operation except `initialize`, `close`, and `is_initialized`
/// panics if called before `initialize()` succeeds.
pub struct LexicalIndex {
    config: LexicalConfig,
    conn: Mutex<Option<Connection>>,
}

impl LexicalIndex {
    pub fn new(config: LexicalConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    /// Open (or create) the database and apply the schema. Idempotent.
    pub fn initialize(&self) -> MemoryResult<()> {
        let mut guard = self.conn.lock();
        if guard.is_some() {
            return Ok(());
        }
        if let Some(parent) = std::path::Path::new(&self.config.db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MemoryError::storage("initialize", e))?;
            }
        }
        let conn = Connection::open(&self.config.db_path)
            .map_err(|e| MemoryError::storage("initialize", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| MemoryError::storage("initialize", e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| MemoryError::storage("initialize", e))?;
        info!("[lexical] opened index at {}", self.config.db_path);
        *guard = Some(conn);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.conn.lock().is_some()
    }

    /// Drop the connection. Subsequent operations panic until the next
    /// `initialize()`.
    pub fn close(&self) {
        let mut guard = self.conn.lock();
        if guard.take().is_some() {
            info!("[lexical] closed index at {}", self.config.db_path);
        }
    }

    /// Insert or fully replace a record. The main row and the FTS row are
    /// written in one transaction, so re-inserting the same id can never
    /// leave a duplicate FTS entry.
    pub fn insert(&self, record: &MemoryRecord) -> MemoryResult<()> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().expect(NOT_INITIALIZED);
        let tx = conn
            .transaction()
            .map_err(|e| MemoryError::storage("insert", e))?;
        let tags = serde_json::to_string(&record.tags)
            .map_err(|e| MemoryError::storage("insert", e))?;
        let metadata = serde_json::to_string(&record.metadata)
            .map_err(|e| MemoryError::storage("insert", e))?;
        tx.execute(
            "INSERT OR REPLACE INTO memories (id, content, memory_type, importance, \
             created_at, updated_at, last_accessed, access_count, decay_factor, \
             is_vectorized, is_archived, conflict_flag, tags, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                record.id,
                record.content,
                record.memory_type.as_str(),
                record.importance,
                record.created_at,
                record.updated_at,
                record.last_accessed,
                record.access_count as i64,
                record.decay_factor,
                record.is_vectorized as i64,
                record.is_archived as i64,
                record.conflict_flag as i64,
                tags,
                metadata,
            ],
        )
        .map_err(|e| MemoryError::storage("insert", e))?;
        tx.execute(
            "DELETE FROM memories_fts WHERE memory_id = ?1",
            params![record.id],
        )
        .map_err(|e| MemoryError::storage("insert", e))?;
        tx.execute(
            "INSERT INTO memories_fts (memory_id, content) VALUES (?1, ?2)",
            params![record.id, record.content],
        )
        .map_err(|e| MemoryError::storage("insert", e))?;
        tx.commit().map_err(|e| MemoryError::storage("insert", e))?;
        Ok(())
    }

    /// Ranked lexical search: `(memory_id, score)` pairs, best first.
    ///
    /// ASCII-ish queries go through FTS5 MATCH with BM25 ranking (negated,
    /// so higher is better). Queries containing CJK text fall back to a
    /// LIKE substring scan because unicode61 cannot segment unspaced CJK;
    /// fallback hits are scored by stored importance, which means two CJK
    /// matches of very different textual relevance can tie.
    ///
    /// Malformed queries are not errors: after sanitization removes FTS
    /// operators, a residual syntax failure logs a warning and returns an
    /// empty list.
    pub fn search(
        &self,
        query: &str,
        top_k: Option<usize>,
        time_window: Option<&TimeWindow>,
        memory_types: Option<&[MemoryType]>,
        min_importance: f64,
    ) -> MemoryResult<Vec<(String, f64)>> {
        let limit = top_k.unwrap_or(self.config.top_k);
        let sanitized = sanitize_query(query);
        if sanitized.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let guard = self.conn.lock();
        let conn = guard.as_ref().expect(NOT_INITIALIZED);

        if contains_cjk(&sanitized) {
            let (filter_sql, filter_params) =
                build_filters("", time_window, memory_types, min_importance);
            let pattern = format!("%{}%", escape_like(&sanitized));
            let sql = format!(
                "SELECT id, importance FROM memories \
                 WHERE content LIKE ?1 ESCAPE '\\' AND is_archived = 0{filter_sql} \
                 ORDER BY importance DESC LIMIT {limit}"
            );
            let mut sql_params: Vec<SqlValue> = vec![SqlValue::Text(pattern)];
            sql_params.extend(filter_params);
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| MemoryError::storage("search", e))?;
            let rows = stmt
                .query_map(params_from_iter(sql_params), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                })
                .map_err(|e| MemoryError::storage("search", e))?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.map_err(|e| MemoryError::storage("search", e))?);
            }
            return Ok(out);
        }

        let (filter_sql, filter_params) =
            build_filters("m.", time_window, memory_types, min_importance);
        let sql = format!(
            "SELECT m.id, bm25(memories_fts) AS rank FROM memories_fts \
             JOIN memories m ON m.id = memories_fts.memory_id \
             WHERE memories_fts MATCH ?1 AND m.is_archived = 0{filter_sql} \
             ORDER BY rank ASC LIMIT {limit}"
        );
        let mut sql_params: Vec<SqlValue> = vec![SqlValue::Text(sanitized.clone())];
        sql_params.extend(filter_params);
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| MemoryError::storage("search", e))?;
        let rows = match stmt.query_map(params_from_iter(sql_params), |row| {
            // FTS5 rank is negative (lower = better); negate for consistency.
            Ok((row.get::<_, String>(0)?, -row.get::<_, f64>(1)?))
        }) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("[lexical] FTS query rejected ({e}), returning empty for {sanitized:?}");
                return Ok(Vec::new());
            }
        };
        let mut out = Vec::new();
        for row in rows {
            match row {
                Ok(pair) => out.push(pair),
                Err(e) => {
                    warn!("[lexical] FTS query failed mid-scan ({e}), returning empty");
                    return Ok(Vec::new());
                }
            }
        }
        Ok(out)
    }

    /// Fetch a full record by id.
    pub fn get(&self, id: &str) -> MemoryResult<Option<MemoryRecord>> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().expect(NOT_INITIALIZED);
        let sql = format!("SELECT {SELECT_COLUMNS} FROM memories WHERE id = ?1");
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| MemoryError::storage("get", e))?;
        let mut rows = stmt
            .query(params![id])
            .map_err(|e| MemoryError::storage("get", e))?;
        match rows.next().map_err(|e| MemoryError::storage("get", e))? {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }

    /// Count of live (non-archived) records.
    pub fn count(&self) -> MemoryResult<usize> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().expect(NOT_INITIALIZED);
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM memories WHERE is_archived = 0",
                [],
                |row| row.get(0),
            )
            .map_err(|e| MemoryError::storage("count", e))?;
        Ok(n as usize)
    }

    /// Delete a record and its FTS row. Returns whether a row existed.
    pub fn delete(&self, id: &str) -> MemoryResult<bool> {
        let mut guard = self.conn.lock();
        let conn = guard.as_mut().expect(NOT_INITIALIZED);
        let tx = conn
            .transaction()
            .map_err(|e| MemoryError::storage("delete", e))?;
        let deleted = tx
            .execute("DELETE FROM memories WHERE id = ?1", params![id])
            .map_err(|e| MemoryError::storage("delete", e))?;
        tx.execute(
            "DELETE FROM memories_fts WHERE memory_id = ?1",
            params![id],
        )
        .map_err(|e| MemoryError::storage("delete", e))?;
        tx.commit().map_err(|e| MemoryError::storage("delete", e))?;
        Ok(deleted > 0)
    }

    /// Persist retrieval bookkeeping for a record.
    pub fn record_access(
        &self,
        id: &str,
        access_count: u64,
        last_accessed: Option<&str>,
    ) -> MemoryResult<()> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().expect(NOT_INITIALIZED);
        conn.execute(
            "UPDATE memories SET access_count = ?2, last_accessed = ?3 WHERE id = ?1",
            params![id, access_count as i64, last_accessed],
        )
        .map_err(|e| MemoryError::storage("record_access", e))?;
        Ok(())
    }

    /// Flip the vectorization flag after the ANN index accepts a vector.
    pub fn set_vectorized(&self, id: &str, vectorized: bool) -> MemoryResult<()> {
        let guard = self.conn.lock();
        let conn = guard.as_ref().expect(NOT_INITIALIZED);
        conn.execute(
            "UPDATE memories SET is_vectorized = ?2 WHERE id = ?1",
            params![id, vectorized as i64],
        )
        .map_err(|e| MemoryError::storage("set_vectorized", e))?;
        Ok(())
    }
}

// ── Row decoding ───────────────────────────────────────────────────────────

fn row_to_record(row: &rusqlite::Row<'_>) -> MemoryResult<MemoryRecord> {
    let map_err = |e: rusqlite::Error| MemoryError::storage("get", e);
    let memory_type_raw: String = row.get(2).map_err(map_err)?;
    let memory_type = memory_type_raw
        .parse::<MemoryType>()
        .map_err(|e| MemoryError::storage("get", e))?;
    let tags_raw: String = row.get(12).map_err(map_err)?;
    let tags: Vec<String> = serde_json::from_str(&tags_raw)
        .map_err(|e| MemoryError::storage("get", e))?;
    let metadata_raw: String = row.get(13).map_err(map_err)?;
    let metadata: JsonMap = serde_json::from_str(&metadata_raw)
        .map_err(|e| MemoryError::storage("get", e))?;
    Ok(MemoryRecord {
        id: row.get(0).map_err(map_err)?,
        content: row.get(1).map_err(map_err)?,
        memory_type,
        importance: row.get(3).map_err(map_err)?,
        created_at: row.get(4).map_err(map_err)?,
        updated_at: row.get(5).map_err(map_err)?,
        last_accessed: row.get(6).map_err(map_err)?,
        access_count: row.get::<_, i64>(7).map_err(map_err)? as u64,
        decay_factor: row.get(8).map_err(map_err)?,
        is_vectorized: row.get::<_, i64>(9).map_err(map_err)? != 0,
        is_archived: row.get::<_, i64>(10).map_err(map_err)? != 0,
        conflict_flag: row.get::<_, i64>(11).map_err(map_err)? != 0,
        tags,
        metadata,
    })
}

// ── Query helpers ──────────────────────────────────────────────────────────

/// Strip FTS5 operator characters and collapse whitespace. Keeps the query
/// usable as a bare-term MATCH expression.
fn sanitize_query(query: &str) -> String {
    static OPERATORS: OnceLock<Regex> = OnceLock::new();
    let re = OPERATORS.get_or_init(|| {
        Regex::new(r#"["*\-+^:(){}\[\]]"#).unwrap_or_else(|e| panic!("operator regex: {e}"))
    });
    let stripped = re.replace_all(query, " ");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Any Han, kana, or CJK-compatibility code point triggers the LIKE path.
fn contains_cjk(text: &str) -> bool {
    text.chars().any(|c| {
        matches!(c as u32,
            0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0x3040..=0x30FF | 0xF900..=0xFAFF)
    })
}

/// Escape `%`, `_`, and `\` for a LIKE pattern with `ESCAPE '\'`.
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Shared filter tail for both search paths. `prefix` is the table alias
/// ("m." on the FTS join, empty on the plain scan). Parameter numbering
/// starts at ?2 because ?1 is always the query text / pattern.
fn build_filters(
    prefix: &str,
    time_window: Option<&TimeWindow>,
    memory_types: Option<&[MemoryType]>,
    min_importance: f64,
) -> (String, Vec<SqlValue>) {
    let mut sql = String::new();
    let mut params: Vec<SqlValue> = Vec::new();
    let mut next = 2usize;
    if min_importance > 0.0 {
        sql.push_str(&format!(" AND {prefix}importance >= ?{next}"));
        params.push(SqlValue::Real(min_importance));
        next += 1;
    }
    if let Some(window) = time_window {
        if let Some(start) = window.start {
            sql.push_str(&format!(" AND {prefix}created_at >= ?{next}"));
            params.push(SqlValue::Text(
                start.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            ));
            next += 1;
        }
        if let Some(end) = window.end {
            sql.push_str(&format!(" AND {prefix}created_at <= ?{next}"));
            params.push(SqlValue::Text(
                end.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            ));
            next += 1;
        }
    }
    if let Some(types) = memory_types {
        if !types.is_empty() {
            let placeholders: Vec<String> = types
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", next + i))
                .collect();
            sql.push_str(&format!(
                " AND {prefix}memory_type IN ({})",
                placeholders.join(", ")
            ));
            for ty in types {
                params.push(SqlValue::Text(ty.as_str().to_string()));
            }
        }
    }
    (sql, params)
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
