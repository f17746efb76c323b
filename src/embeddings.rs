//! Semantic Embeddings
//!
//! Maps rule text and live reasoning excerpts to fixed-length vectors.
//!
//! Backends:
//! 1. Local all-MiniLM-L6-v2 via ONNX Runtime (22MB, 384 dimensions, CPU)
//! 2. Any OpenAI-compatible `/embeddings` endpoint
//! 3. None: retrieval falls back to keyword overlap
//!
//! Candidate vectors are cached in memory and in the `heuristic_embeddings`
//! table, keyed by a SHA-256 of the embedded text so an edited rule is
//! re-embedded instead of served stale.

use crate::config::{EmbeddingConfig, EngineConfig};
use crate::db::Store;
use crate::error::{EngineError, Result};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use ndarray::Array2;
use ort::{
    inputs,
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

/// Embedding dimensions for all-MiniLM-L6-v2
pub const EMBEDDING_DIM: usize = 384;

/// Maximum sequence length for the model
const MAX_SEQ_LEN: usize = 256;

/// How often a caller checks on items another task is embedding
const IN_FLIGHT_POLL: Duration = Duration::from_millis(10);

/// Text to vector
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Stable identifier; cached vectors are scoped by it
    fn model_id(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Build the configured backend, `None` for keyword-only retrieval
pub fn embedder_from_config(config: &EngineConfig) -> Result<Option<Arc<dyn Embedder>>> {
    match &config.embedding {
        EmbeddingConfig::None => Ok(None),
        EmbeddingConfig::Onnx { .. } => {
            let embedder = OnnxEmbedder::load(&config.model_dir())?;
            Ok(Some(Arc::new(embedder)))
        }
        EmbeddingConfig::Http {
            url,
            model,
            api_key,
        } => Ok(Some(Arc::new(HttpEmbedder::new(url, model, api_key.clone())))),
    }
}

struct OnnxInner {
    session: Session,
    tokenizer: Tokenizer,
}

/// Local MiniLM model
pub struct OnnxEmbedder {
    inner: Arc<Mutex<OnnxInner>>,
}

impl OnnxEmbedder {
    /// Load the model from `model_dir`, downloading it on first use
    pub fn load(model_dir: &Path) -> Result<Self> {
        Self::load_inner(model_dir).map_err(|e| EngineError::Embedding(format!("{e:#}")))
    }

    fn load_inner(model_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(model_dir)
            .with_context(|| format!("cannot create model dir {}", model_dir.display()))?;

        let model_path = model_dir.join("model.onnx");
        let tokenizer_path = model_dir.join("tokenizer.json");

        if !model_path.exists() || !tokenizer_path.exists() {
            Self::download_model(model_dir)?;
        }

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)
            .context("Failed to load ONNX model")?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        info!(model_dir = %model_dir.display(), "embedding model loaded");
        Ok(Self {
            inner: Arc::new(Mutex::new(OnnxInner { session, tokenizer })),
        })
    }

    /// Download the embedding model from HuggingFace
    fn download_model(model_dir: &Path) -> anyhow::Result<()> {
        use hf_hub::api::sync::Api;

        info!("downloading embedding model (all-MiniLM-L6-v2)");
        let api = Api::new()?;
        let repo = api.model("sentence-transformers/all-MiniLM-L6-v2".to_string());

        let model_path = repo.get("onnx/model.onnx")?;
        std::fs::copy(&model_path, model_dir.join("model.onnx"))?;

        let tokenizer_path = repo.get("tokenizer.json")?;
        std::fs::copy(&tokenizer_path, model_dir.join("tokenizer.json"))?;

        info!("embedding model downloaded");
        Ok(())
    }

    fn embed_blocking(inner: &mut OnnxInner, text: &str) -> anyhow::Result<Vec<f32>> {
        let encoding = inner
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;

        let len = encoding.get_ids().len().min(MAX_SEQ_LEN);
        if len == 0 {
            return Ok(vec![0.0; EMBEDDING_DIM]);
        }
        let ids: Vec<i64> = encoding.get_ids()[..len].iter().map(|&id| id as i64).collect();
        let mask: Vec<i64> = encoding.get_attention_mask()[..len]
            .iter()
            .map(|&m| m as i64)
            .collect();

        let input_ids = Array2::from_shape_vec((1, len), ids)?;
        let attention = Array2::from_shape_vec((1, len), mask)?;
        let token_types = Array2::from_shape_vec((1, len), vec![0i64; len])?;

        let outputs = inner.session.run(inputs![
            "input_ids" => Tensor::from_array(input_ids)?,
            "attention_mask" => Tensor::from_array(attention)?,
            "token_type_ids" => Tensor::from_array(token_types)?,
        ])?;

        let output = outputs
            .get("last_hidden_state")
            .or_else(|| outputs.get("token_embeddings"))
            .ok_or_else(|| anyhow!("No embedding output found"))?;

        let (shape, data) = output.try_extract_tensor::<f32>()?;
        let embed_dim = if shape.len() >= 3 {
            shape[2] as usize
        } else {
            EMBEDDING_DIM
        };
        let pooled = mean_pool(data, len, embed_dim);
        Ok(l2_normalize(&pooled))
    }
}

#[async_trait]
impl Embedder for OnnxEmbedder {
    fn model_id(&self) -> &str {
        "all-MiniLM-L6-v2"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let inner = Arc::clone(&self.inner);
        let text = text.to_string();
        tokio::task::spawn_blocking(move || {
            let mut guard = inner.lock();
            Self::embed_blocking(&mut guard, &text)
        })
        .await?
        .map_err(|e| EngineError::Embedding(format!("{e:#}")))
    }
}

/// Mean pooling over the sequence dimension of a `[1, seq_len, dim]` tensor
fn mean_pool(data: &[f32], seq_len: usize, embed_dim: usize) -> Vec<f32> {
    let dim = embed_dim.min(EMBEDDING_DIM);
    let mut result = vec![0.0f32; EMBEDDING_DIM];
    for i in 0..seq_len {
        for (j, slot) in result.iter_mut().enumerate().take(dim) {
            if let Some(v) = data.get(i * embed_dim + j) {
                *slot += v;
            }
        }
    }
    for v in result.iter_mut() {
        *v /= seq_len as f32;
    }
    result
}

/// OpenAI-compatible embedding endpoint
pub struct HttpEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(url: &str, model: &str, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut request = self
            .client
            .post(format!("{}/embeddings", self.url))
            .json(&EmbeddingRequest {
                model: &self.model,
                input: text,
            });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| EngineError::Embedding(format!("embedding request failed: {e}")))?;
        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Embedding(format!("invalid embedding response: {e}")))?;

        let vector = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EngineError::Embedding("embedding response had no data".into()))?;
        Ok(l2_normalize(&vector))
    }
}

/// L2 normalize a vector; the zero vector is returned unchanged
pub fn l2_normalize(vec: &[f32]) -> Vec<f32> {
    let norm: f32 = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        vec.iter().map(|x| x / norm).collect()
    } else {
        vec.to_vec()
    }
}

/// Cosine similarity; 0 for mismatched lengths or zero vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Cache key for a piece of text
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Something worth embedding: a stable item id and its text
#[derive(Debug, Clone)]
pub struct EmbedItem {
    pub id: String,
    pub text: String,
}

/// Releases claimed ids even if the embedder panics
struct InFlightRelease {
    in_flight: Arc<Mutex<HashSet<String>>>,
    ids: Vec<String>,
}

impl Drop for InFlightRelease {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock();
        for id in &self.ids {
            in_flight.remove(id);
        }
    }
}

#[derive(Clone)]
struct CachedVector {
    hash: String,
    vector: Arc<Vec<f32>>,
}

/// Two-level vector cache in front of an optional embedder
#[derive(Clone)]
pub struct EmbeddingIndex {
    embedder: Option<Arc<dyn Embedder>>,
    store: Store,
    memory: Arc<RwLock<HashMap<String, CachedVector>>>,
    /// Item ids some task is embedding right now
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl EmbeddingIndex {
    pub fn new(store: Store, embedder: Option<Arc<dyn Embedder>>) -> Self {
        Self {
            embedder,
            store,
            memory: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.embedder.is_some()
    }

    fn embedder(&self) -> Result<&Arc<dyn Embedder>> {
        self.embedder
            .as_ref()
            .ok_or_else(|| EngineError::Embedding("no embedding backend configured".into()))
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        self.embedder()?.embed(text).await
    }

    /// Memory hits, and the misses with their text hashes
    fn from_memory(&self, items: &[EmbedItem]) -> (HashMap<String, Arc<Vec<f32>>>, Vec<(EmbedItem, String)>) {
        let memory = self.memory.read();
        let mut found = HashMap::new();
        let mut misses = Vec::new();
        for item in items {
            let hash = text_hash(&item.text);
            match memory.get(&item.id) {
                Some(cached) if cached.hash == hash => {
                    found.insert(item.id.clone(), Arc::clone(&cached.vector));
                }
                _ => misses.push((item.clone(), hash)),
            }
        }
        (found, misses)
    }

    fn remember(&self, id: &str, hash: &str, vector: Arc<Vec<f32>>) {
        self.memory.write().insert(
            id.to_string(),
            CachedVector {
                hash: hash.to_string(),
                vector,
            },
        );
    }

    /// Vectors for `items`, from memory, then the store, then the embedder.
    ///
    /// Misses are embedded by a detached task that writes every vector to
    /// both cache levels as soon as it exists, so a caller that gives up
    /// (timeout) still leaves the work behind for the next query. Items
    /// another call is already embedding are waited for, not embedded twice.
    pub async fn vectors_for(&self, items: &[EmbedItem]) -> Result<HashMap<String, Arc<Vec<f32>>>> {
        let embedder = Arc::clone(self.embedder()?);
        let model = embedder.model_id().to_string();

        let (mut found, misses) = self.from_memory(items);
        if misses.is_empty() {
            return Ok(found);
        }

        let lookup: Vec<(String, String)> = misses
            .iter()
            .map(|(item, hash)| (item.id.clone(), hash.clone()))
            .collect();
        let lookup_model = model.clone();
        let persisted: HashMap<String, Vec<f32>> = self
            .store
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT vector FROM heuristic_embeddings
                     WHERE item_id = ?1 AND model = ?2 AND text_hash = ?3",
                )?;
                let mut hits = HashMap::new();
                for (id, hash) in &lookup {
                    let blob: Option<Vec<u8>> = stmt
                        .query_row(params![id, lookup_model, hash], |row| row.get(0))
                        .optional()?;
                    if let Some(blob) = blob {
                        hits.insert(id.clone(), blob_to_vector(&blob));
                    }
                }
                Ok(hits)
            })
            .await?;

        let mut pending = Vec::new();
        for (item, hash) in misses {
            match persisted.get(&item.id) {
                Some(vector) => {
                    let vector = Arc::new(vector.clone());
                    self.remember(&item.id, &hash, Arc::clone(&vector));
                    found.insert(item.id, vector);
                }
                None => pending.push((item, hash)),
            }
        }
        if pending.is_empty() {
            return Ok(found);
        }

        let (claimed, elsewhere): (Vec<_>, Vec<_>) = {
            let mut in_flight = self.in_flight.lock();
            pending
                .into_iter()
                .partition(|(item, _)| in_flight.insert(item.id.clone()))
        };

        if !claimed.is_empty() {
            let index = self.clone();
            let task = tokio::spawn(async move { index.embed_and_cache(embedder, model, claimed).await });
            match task.await {
                Ok(computed) => found.extend(computed),
                Err(err) => warn!(error = %err, "embedding task did not finish"),
            }
        }

        if !elsewhere.is_empty() {
            let ids: Vec<EmbedItem> = elsewhere.into_iter().map(|(item, _)| item).collect();
            while ids.iter().any(|item| self.in_flight.lock().contains(&item.id)) {
                tokio::time::sleep(IN_FLIGHT_POLL).await;
            }
            let (more, _) = self.from_memory(&ids);
            found.extend(more);
        }

        Ok(found)
    }

    async fn embed_and_cache(
        &self,
        embedder: Arc<dyn Embedder>,
        model: String,
        items: Vec<(EmbedItem, String)>,
    ) -> HashMap<String, Arc<Vec<f32>>> {
        let _release = InFlightRelease {
            in_flight: Arc::clone(&self.in_flight),
            ids: items.iter().map(|(item, _)| item.id.clone()).collect(),
        };
        let mut computed = HashMap::new();
        for (item, hash) in items {
            let result = embedder.embed(&item.text).await;
            match result {
                Ok(vector) => {
                    let vector = Arc::new(vector);
                    self.remember(&item.id, &hash, Arc::clone(&vector));
                    if let Err(err) = self.persist(&model, &item.id, &hash, &vector).await {
                        warn!(item_id = %item.id, error = %err, "failed to persist embedding");
                    }
                    computed.insert(item.id.clone(), vector);
                }
                Err(err) => {
                    warn!(item_id = %item.id, error = %err, "failed to embed candidate");
                }
            }
            self.in_flight.lock().remove(&item.id);
        }
        debug!(count = computed.len(), "embedded and cached candidates");
        computed
    }

    async fn persist(&self, model: &str, id: &str, hash: &str, vector: &[f32]) -> Result<()> {
        let (model, id, hash) = (model.to_string(), id.to_string(), hash.to_string());
        let blob = vector_to_blob(vector);
        let dims = vector.len() as i64;
        self.store
            .transaction("embeddings.persist", move |tx| {
                tx.execute(
                    "INSERT OR REPLACE INTO heuristic_embeddings
                     (item_id, model, text_hash, dims, vector, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![id, model, hash, dims, blob, Utc::now().to_rfc3339()],
                )?;
                Ok(())
            })
            .await
    }

    /// Precompute vectors so the first query does not pay for them
    pub async fn warm(&self, items: &[EmbedItem]) -> Result<usize> {
        Ok(self.vectors_for(items).await?.len())
    }

    /// Drop a cached vector from memory
    pub fn forget(&self, item_id: &str) {
        self.memory.write().remove(item_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::migrations::run_migrations;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_id(&self) -> &str {
            "counting"
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(l2_normalize(&[text.len() as f32, 1.0, 0.0]))
        }
    }

    async fn store() -> Store {
        let store = Store::open_in_memory(&StoreConfig::default()).unwrap();
        store.call(|conn| run_migrations(conn).map(|_| ())).await.unwrap();
        store
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 0.001);

        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_l2_normalize() {
        let normalized = l2_normalize(&[3.0, 4.0]);
        assert!((normalized[0] - 0.6).abs() < 0.001);
        assert!((normalized[1] - 0.8).abs() < 0.001);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_blob_roundtrip_and_hash() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(blob_to_vector(&vector_to_blob(&v)), v);
        assert_eq!(text_hash("a"), text_hash("a"));
        assert_ne!(text_hash("a"), text_hash("b"));
    }

    #[test]
    fn test_mean_pool() {
        // two tokens, dim 2 in a 384-wide result
        let pooled = mean_pool(&[1.0, 2.0, 3.0, 4.0], 2, 2);
        assert_eq!(pooled.len(), EMBEDDING_DIM);
        assert!((pooled[0] - 2.0).abs() < 1e-6);
        assert!((pooled[1] - 3.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_index_caches_and_reembeds_edited_text() {
        let store = store().await;
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let index = EmbeddingIndex::new(store.clone(), Some(embedder.clone()));

        let items = vec![
            EmbedItem {
                id: "h:1".into(),
                text: "Prefer explicit timeouts".into(),
            },
            EmbedItem {
                id: "h:2".into(),
                text: "Always null-check before dereference".into(),
            },
        ];
        assert_eq!(index.warm(&items).await.unwrap(), 2);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);

        // memory hit
        index.vectors_for(&items).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);

        // a fresh index over the same store hits the persisted cache
        let cold = EmbeddingIndex::new(store.clone(), Some(embedder.clone()));
        cold.vectors_for(&items).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);

        // edited text is re-embedded
        let edited = vec![EmbedItem {
            id: "h:1".into(),
            text: "Prefer explicit, short timeouts".into(),
        }];
        cold.vectors_for(&edited).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_index_without_backend() {
        let index = EmbeddingIndex::new(store().await, None);
        assert!(!index.is_enabled());
        assert!(matches!(
            index.embed_query("anything").await,
            Err(EngineError::Embedding(_))
        ));
    }
}
