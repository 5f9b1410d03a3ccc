// ── Kioku Engine: Vector Index ─────────────────────────────────────────────
// ANN index over embedding vectors with an external-id mapping layer:
// callers only ever see memory-record ids, internal u64 ids are an
// implementation detail. Two topologies: exact flat scan (default) and an
// HNSW graph for larger stores.
//
// Persistence is a pair of files: the vector file (MessagePack dump of
// (internal_id, vector) pairs) plus a JSON sidecar holding the id maps and
// the next-id counter. Both are written atomically together by save().

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use hnsw_rs::prelude::*;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::atoms::error::{MemoryError, MemoryResult};

const NOT_INITIALIZED: &str = "VectorIndex not initialized: call initialize() first";

// HNSW construction parameters. Sized for a companion-scale store
// (≤ 100k vectors).
const HNSW_MAX_CONNECTIONS: usize = 32;
const HNSW_MAX_ELEMENTS: usize = 100_000;
const HNSW_MAX_LAYER: usize = 16;
const HNSW_EF_CONSTRUCTION: usize = 200;

// ── Config ─────────────────────────────────────────────────────────────────

/// Index layout strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexTopology {
    /// Exact brute-force scan. Correct at any size, fast enough below
    /// ~50k vectors.
    Flat,
    /// Approximate graph search.
    Hnsw,
}

#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    /// Vector file path; the JSON sidecar lives next to it with a `.json`
    /// extension.
    pub index_path: PathBuf,
    /// Expected embedding dimension.
    pub dimension: usize,
    pub topology: IndexTopology,
    /// HNSW search beam width (ignored by the flat topology).
    pub ef_search: usize,
    /// Default result count when the caller passes no limit.
    pub top_k: usize,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            index_path: PathBuf::from("./data/vector/memory.index"),
            dimension: 384,
            topology: IndexTopology::Flat,
            ef_search: 64,
            top_k: 15,
        }
    }
}

// ── Sidecar layout ─────────────────────────────────────────────────────────
// BTreeMaps keep the serialized sidecar deterministic.

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    /// internal id (as a string key) → external memory id
    id_map: BTreeMap<String, String>,
    /// external memory id → internal id
    reverse_id_map: BTreeMap<String, u64>,
    next_id: u64,
}

// ── Index ──────────────────────────────────────────────────────────────────

/// Vector index keyed by external memory ids.
///
/// Not internally synchronized: wrap in a lock for shared use.
///
/// # Panics
///
/// `search`, `add_vectors`, `remove_vectors`, and `save` panic if called
/// before `initialize()` succeeds.
pub struct VectorIndex {
    config: VectorIndexConfig,
    vectors: HashMap<u64, Vec<f32>>,
    id_map: HashMap<u64, String>,
    reverse_id_map: HashMap<String, u64>,
    next_id: u64,
    hnsw: Option<Hnsw<'static, f32, DistCosine>>,
    initialized: bool,
}

impl VectorIndex {
    pub fn new(config: VectorIndexConfig) -> Self {
        Self {
            config,
            vectors: HashMap::new(),
            id_map: HashMap::new(),
            reverse_id_map: HashMap::new(),
            next_id: 0,
            hnsw: None,
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Whether a vector exists for this memory id.
    pub fn has_vector(&self, memory_id: &str) -> bool {
        self.reverse_id_map.contains_key(memory_id)
    }

    /// Configured embedding dimension.
    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn sidecar_path(&self) -> PathBuf {
        self.config.index_path.with_extension("json")
    }

    /// Load persisted state if both files exist, otherwise start empty.
    /// Idempotent.
    pub fn initialize(&mut self) -> MemoryResult<()> {
        if self.initialized {
            return Ok(());
        }
        if let Some(parent) = self.config.index_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MemoryError::storage("initialize", e))?;
            }
        }
        let vector_path = self.config.index_path.clone();
        let sidecar_path = self.sidecar_path();
        if vector_path.exists() && sidecar_path.exists() {
            self.load(&vector_path, &sidecar_path)?;
            info!(
                "[vector] loaded {} vectors from {}",
                self.vectors.len(),
                vector_path.display()
            );
        } else {
            info!("[vector] starting empty index at {}", vector_path.display());
        }
        if self.config.topology == IndexTopology::Hnsw {
            self.rebuild_graph();
        }
        self.initialized = true;
        Ok(())
    }

    fn load(&mut self, vector_path: &Path, sidecar_path: &Path) -> MemoryResult<()> {
        let raw = std::fs::read(vector_path)
            .map_err(|e| MemoryError::storage("load", e))?;
        let pairs: Vec<(u64, Vec<f32>)> = rmp_serde::from_slice(&raw)
            .map_err(|e| MemoryError::storage("load", e))?;
        let sidecar_raw = std::fs::read(sidecar_path)
            .map_err(|e| MemoryError::storage("load", e))?;
        let sidecar: Sidecar = serde_json::from_slice(&sidecar_raw)
            .map_err(|e| MemoryError::storage("load", e))?;

        let mut vectors = HashMap::with_capacity(pairs.len());
        for (internal_id, vector) in pairs {
            if vector.len() != self.config.dimension {
                return Err(MemoryError::storage(
                    "load",
                    format!(
                        "stored vector {internal_id} has dimension {}, expected {}",
                        vector.len(),
                        self.config.dimension
                    ),
                ));
            }
            vectors.insert(internal_id, vector);
        }
        let mut id_map = HashMap::with_capacity(sidecar.id_map.len());
        for (internal_raw, external) in sidecar.id_map {
            let internal = internal_raw
                .parse::<u64>()
                .map_err(|e| MemoryError::storage("load", e))?;
            id_map.insert(internal, external);
        }
        self.vectors = vectors;
        self.id_map = id_map;
        self.reverse_id_map = sidecar.reverse_id_map.into_iter().collect();
        self.next_id = sidecar.next_id;
        Ok(())
    }

    /// Persist the vector file and the JSON sidecar.
    ///
    /// # Panics
    ///
    /// Panics if called before `initialize()` succeeds.
    pub fn save(&self) -> MemoryResult<()> {
        assert!(self.initialized, "{NOT_INITIALIZED}");
        if let Some(parent) = self.config.index_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MemoryError::storage("save", e))?;
            }
        }
        let mut pairs: Vec<(u64, Vec<f32>)> = self
            .vectors
            .iter()
            .map(|(id, v)| (*id, v.clone()))
            .collect();
        pairs.sort_by_key(|(id, _)| *id);
        let encoded = rmp_serde::to_vec(&pairs)
            .map_err(|e| MemoryError::storage("save", e))?;
        std::fs::write(&self.config.index_path, encoded)
            .map_err(|e| MemoryError::storage("save", e))?;

        let sidecar = Sidecar {
            id_map: self
                .id_map
                .iter()
                .map(|(internal, external)| (internal.to_string(), external.clone()))
                .collect(),
            reverse_id_map: self
                .reverse_id_map
                .iter()
                .map(|(external, internal)| (external.clone(), *internal))
                .collect(),
            next_id: self.next_id,
        };
        let sidecar_json = serde_json::to_vec_pretty(&sidecar)
            .map_err(|e| MemoryError::storage("save", e))?;
        std::fs::write(self.sidecar_path(), sidecar_json)
            .map_err(|e| MemoryError::storage("save", e))?;
        info!(
            "[vector] saved {} vectors to {}",
            self.vectors.len(),
            self.config.index_path.display()
        );
        Ok(())
    }

    /// Add vectors for a batch of memory ids. Ids that already have a
    /// vector are skipped with a warning (add is idempotent). Returns the
    /// number actually added.
    ///
    /// # Panics
    ///
    /// Panics if called before `initialize()` succeeds.
    pub fn add_vectors(
        &mut self,
        memory_ids: &[String],
        vectors: &[Vec<f32>],
    ) -> MemoryResult<usize> {
        assert!(self.initialized, "{NOT_INITIALIZED}");
        if memory_ids.len() != vectors.len() {
            return Err(MemoryError::storage(
                "add_vectors",
                format!("{} ids but {} vectors", memory_ids.len(), vectors.len()),
            ));
        }
        for vector in vectors {
            if vector.len() != self.config.dimension {
                return Err(MemoryError::storage(
                    "add_vectors",
                    format!(
                        "dimension mismatch: got {}, expected {}",
                        vector.len(),
                        self.config.dimension
                    ),
                ));
            }
        }
        let mut added = 0;
        for (memory_id, vector) in memory_ids.iter().zip(vectors) {
            if self.reverse_id_map.contains_key(memory_id) {
                warn!("[vector] {memory_id} already indexed, skipping");
                continue;
            }
            let internal = self.next_id;
            self.next_id += 1;
            self.vectors.insert(internal, vector.clone());
            self.id_map.insert(internal, memory_id.clone());
            self.reverse_id_map.insert(memory_id.clone(), internal);
            if let Some(graph) = &self.hnsw {
                graph.insert((vector.as_slice(), internal as usize));
            }
            added += 1;
        }
        Ok(added)
    }

    /// Nearest-neighbour search: `(memory_id, score)` pairs sorted by
    /// score descending, filtered to `score >= threshold`. Scores are
    /// cosine similarity in [-1, 1].
    ///
    /// # Panics
    ///
    /// Panics if called before `initialize()` succeeds.
    pub fn search(
        &self,
        query: &[f32],
        top_k: Option<usize>,
        threshold: f64,
    ) -> MemoryResult<Vec<(String, f64)>> {
        assert!(self.initialized, "{NOT_INITIALIZED}");
        if query.len() != self.config.dimension {
            return Err(MemoryError::storage(
                "search",
                format!(
                    "query dimension {}, index dimension {}",
                    query.len(),
                    self.config.dimension
                ),
            ));
        }
        if self.vectors.is_empty() {
            return Ok(Vec::new());
        }
        let k = top_k.unwrap_or(self.config.top_k).min(self.vectors.len());
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(u64, f64)> = match &self.hnsw {
            Some(graph) => {
                let ef = self.config.ef_search.max(k);
                graph
                    .search(query, k, ef)
                    .into_iter()
                    .map(|n| (n.d_id as u64, 1.0 - n.distance as f64))
                    .collect()
            }
            None => {
                let mut all: Vec<(u64, f64)> = self
                    .vectors
                    .iter()
                    .map(|(id, v)| (*id, dot(query, v)))
                    .collect();
                all.sort_by(|a, b| b.1.total_cmp(&a.1));
                all.truncate(k);
                all
            }
        };
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut out = Vec::with_capacity(scored.len());
        for (internal, score) in scored {
            if score < threshold {
                continue;
            }
            match self.id_map.get(&internal) {
                Some(external) => out.push((external.clone(), score)),
                None => warn!("[vector] internal id {internal} has no external mapping"),
            }
        }
        Ok(out)
    }

    /// Remove vectors for the given memory ids. Unknown ids are ignored.
    /// Returns the number removed. The HNSW graph, if active, is rebuilt
    /// from the surviving vectors (the graph has no true deletion).
    ///
    /// # Panics
    ///
    /// Panics if called before `initialize()` succeeds.
    pub fn remove_vectors(&mut self, memory_ids: &[String]) -> usize {
        assert!(self.initialized, "{NOT_INITIALIZED}");
        let mut removed = 0;
        for memory_id in memory_ids {
            if let Some(internal) = self.reverse_id_map.remove(memory_id) {
                self.vectors.remove(&internal);
                self.id_map.remove(&internal);
                removed += 1;
            }
        }
        if removed > 0 && self.hnsw.is_some() {
            self.rebuild_graph();
        }
        removed
    }

    fn rebuild_graph(&mut self) {
        let graph = Hnsw::<f32, DistCosine>::new(
            HNSW_MAX_CONNECTIONS,
            HNSW_MAX_ELEMENTS,
            HNSW_MAX_LAYER,
            HNSW_EF_CONSTRUCTION,
            DistCosine {},
        );
        for (internal, vector) in &self.vectors {
            graph.insert((vector.as_slice(), *internal as usize));
        }
        self.hnsw = Some(graph);
    }
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x * y) as f64).sum()
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
