// ── Kioku Engine: Text Embedder ────────────────────────────────────────────
// HTTP embedding client with lazy initialization. The model dimension is
// discovered by a probe embed rather than configured, so swapping models
// never desynchronizes the vector index dimension check.
//
// Endpoint fallback chain, in order:
//   1. Ollama batch    POST {base_url}/api/embed        {model, input: [..]}
//   2. Ollama legacy   POST {base_url}/api/embeddings   {model, prompt} per text
//   3. OpenAI-style    POST {base_url}/v1/embeddings    {model, input: [..]}

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::{debug, info, warn};
use serde_json::json;

use crate::atoms::error::{MemoryError, MemoryResult};

const NOT_INITIALIZED: &str = "TextEmbedder not initialized: call initialize() first";

// ── Config ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EmbedderConfig {
    /// Base URL of the embedding server.
    pub base_url: String,
    /// Model name passed through to the server.
    pub model: String,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "paraphrase-multilingual".to_string(),
        }
    }
}

// ── Embedder ───────────────────────────────────────────────────────────────

/// Lazy HTTP embedding client. Construction is free; the first
/// `initialize()` performs a probe embed to discover the vector dimension.
///
/// # Panics
///
/// `embed`, `embed_one`, and `dimension` panic if called before
/// `initialize()` succeeds.
pub struct TextEmbedder {
    config: EmbedderConfig,
    client: reqwest::Client,
    dimension: AtomicUsize,
    initialized: AtomicBool,
}

impl TextEmbedder {
    pub fn new(config: EmbedderConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            dimension: AtomicUsize::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Output vector dimension.
    ///
    /// # Panics
    ///
    /// Panics before successful initialization.
    pub fn dimension(&self) -> usize {
        assert!(self.is_initialized(), "{NOT_INITIALIZED}");
        self.dimension.load(Ordering::Acquire)
    }

    /// Probe the server once and record the model dimension. Idempotent;
    /// a second call after success is a no-op.
    pub async fn initialize(&self) -> MemoryResult<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let probe = self.request_embeddings(&["dimension probe".to_string()]).await?;
        let dim = probe
            .first()
            .map(|v| v.len())
            .filter(|d| *d > 0)
            .ok_or_else(|| MemoryError::storage("embed", "probe returned no vector"))?;
        self.dimension.store(dim, Ordering::Release);
        self.initialized.store(true, Ordering::Release);
        info!(
            "[embedder] model {} ready, dimension {dim}",
            self.config.model
        );
        Ok(())
    }

    /// Embed a batch of texts. Outputs are L2-normalized so dot product
    /// equals cosine similarity downstream.
    ///
    /// # Panics
    ///
    /// Panics before successful initialization.
    pub async fn embed(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
        assert!(self.is_initialized(), "{NOT_INITIALIZED}");
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let expected = self.dimension.load(Ordering::Acquire);
        let mut vectors = self.request_embeddings(texts).await?;
        if vectors.len() != texts.len() {
            return Err(MemoryError::storage(
                "embed",
                format!("server returned {} vectors for {} texts", vectors.len(), texts.len()),
            ));
        }
        for vector in &mut vectors {
            if vector.len() != expected {
                return Err(MemoryError::storage(
                    "embed",
                    format!("dimension mismatch: got {}, expected {expected}", vector.len()),
                ));
            }
            l2_normalize(vector);
        }
        Ok(vectors)
    }

    /// Embed a single text.
    ///
    /// # Panics
    ///
    /// Panics before successful initialization.
    pub async fn embed_one(&self, text: &str) -> MemoryResult<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| MemoryError::storage("embed", "empty embedding response"))
    }

    // ── Request chain ──────────────────────────────────────────────────────

    async fn request_embeddings(&self, texts: &[String]) -> MemoryResult<Vec<Vec<f32>>> {
        match self.try_ollama_batch(texts).await {
            Ok(vectors) => return Ok(vectors),
            Err(e) => debug!("[embedder] /api/embed unavailable: {e}"),
        }
        match self.try_ollama_legacy(texts).await {
            Ok(vectors) => return Ok(vectors),
            Err(e) => debug!("[embedder] /api/embeddings unavailable: {e}"),
        }
        match self.try_openai(texts).await {
            Ok(vectors) => Ok(vectors),
            Err(e) => {
                warn!("[embedder] all endpoints failed at {}", self.config.base_url);
                Err(MemoryError::storage("embed", e))
            }
        }
    }

    async fn try_ollama_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
        let url = format!("{}/api/embed", self.config.base_url);
        let body = json!({ "model": self.config.model, "input": texts });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }
        let parsed: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
        parse_vector_array(parsed.get("embeddings"))
            .ok_or_else(|| "missing embeddings field".to_string())
    }

    async fn try_ollama_legacy(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
        let url = format!("{}/api/embeddings", self.config.base_url);
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            let body = json!({ "model": self.config.model, "prompt": text });
            let response = self
                .client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            if !response.status().is_success() {
                return Err(format!("status {}", response.status()));
            }
            let parsed: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
            let vector = parse_vector(parsed.get("embedding"))
                .ok_or_else(|| "missing embedding field".to_string())?;
            out.push(vector);
        }
        Ok(out)
    }

    async fn try_openai(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
        let url = format!("{}/v1/embeddings", self.config.base_url);
        let body = json!({ "model": self.config.model, "input": texts });
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("status {}", response.status()));
        }
        let parsed: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
        let data = parsed
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| "missing data field".to_string())?;
        let mut out = Vec::with_capacity(data.len());
        for item in data {
            let vector = parse_vector(item.get("embedding"))
                .ok_or_else(|| "missing embedding field".to_string())?;
            out.push(vector);
        }
        Ok(out)
    }
}

// ── Parsing + math helpers ─────────────────────────────────────────────────

fn parse_vector(value: Option<&serde_json::Value>) -> Option<Vec<f32>> {
    let array = value?.as_array()?;
    let mut out = Vec::with_capacity(array.len());
    for item in array {
        out.push(item.as_f64()? as f32);
    }
    Some(out)
}

fn parse_vector_array(value: Option<&serde_json::Value>) -> Option<Vec<Vec<f32>>> {
    let array = value?.as_array()?;
    let mut out = Vec::with_capacity(array.len());
    for item in array {
        out.push(parse_vector(Some(item))?);
    }
    Some(out)
}

/// Scale a vector to unit length in place. Zero vectors are left as-is.
pub(crate) fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_normalize_produces_unit_vectors() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_leaves_zero_vectors_alone() {
        let mut v = vec![0.0, 0.0, 0.0];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn parse_vector_rejects_non_numeric_entries() {
        let good = serde_json::json!([0.1, 0.2]);
        assert_eq!(parse_vector(Some(&good)), Some(vec![0.1, 0.2]));
        let bad = serde_json::json!([0.1, "oops"]);
        assert_eq!(parse_vector(Some(&bad)), None);
        assert_eq!(parse_vector(None), None);
    }

    #[test]
    fn parse_vector_array_requires_nested_arrays() {
        let good = serde_json::json!([[1.0], [2.0, 3.0]]);
        assert_eq!(
            parse_vector_array(Some(&good)),
            Some(vec![vec![1.0], vec![2.0, 3.0]])
        );
        let bad = serde_json::json!([1.0, 2.0]);
        assert_eq!(parse_vector_array(Some(&bad)), None);
    }

    #[test]
    #[should_panic(expected = "not initialized")]
    fn dimension_before_initialize_panics() {
        let embedder = TextEmbedder::new(EmbedderConfig::default());
        let _ = embedder.dimension();
    }
}
