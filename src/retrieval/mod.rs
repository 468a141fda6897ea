//! Retrieval over independently queried collections.
//!
//! The vector index and document store are collaborators behind traits;
//! this module owns the merge of per-collection results into one globally
//! ranked top-K list.

pub mod loader;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub use loader::PlainTextStore;
pub use memory::{Embedder, HashEmbedder, InMemoryVectorIndex};

pub type Metadata = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Mismatched index input: {texts} texts, {metadatas} metadatas, {ids} ids")]
    MismatchedInput {
        texts: usize,
        metadatas: usize,
        ids: usize,
    },

    #[error("Failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Vector index error: {0}")]
    Backend(String),
}

pub type RetrievalResult<T> = Result<T, RetrievalError>;

/// One retrieval hit. Lower distance means more similar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub id: String,
    pub distance: f32,
    pub metadata: Metadata,
    pub text: String,
}

impl ScoredDocument {
    pub fn new(id: impl Into<String>, distance: f32) -> Self {
        Self {
            id: id.into(),
            distance,
            metadata: Metadata::new(),
            text: String::new(),
        }
    }
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Indexes `texts` under `collection`. Indexing into a collection that
    /// already exists succeeds without changing it.
    async fn index(
        &self,
        collection: &str,
        texts: &[String],
        metadatas: &[Metadata],
        ids: &[String],
    ) -> RetrievalResult<()>;

    /// Returns up to `k` documents ordered by ascending distance.
    async fn query(
        &self,
        collection: &str,
        query_text: &str,
        k: usize,
    ) -> RetrievalResult<Vec<ScoredDocument>>;

    async fn reset(&self) -> RetrievalResult<()>;
}

#[derive(Debug, Clone)]
pub enum DocumentSource {
    Bytes { filename: String, data: Bytes },
    Url(String),
}

impl DocumentSource {
    pub fn name(&self) -> &str {
        match self {
            DocumentSource::Bytes { filename, .. } => filename,
            DocumentSource::Url(url) => url,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadedChunk {
    pub text: String,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub chunks: Vec<LoadedChunk>,
    /// Whether the format was recognised rather than guessed.
    pub known_type: bool,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load(
        &self,
        source: &DocumentSource,
        content_type: Option<&str>,
    ) -> RetrievalResult<LoadedDocument>;
}

/// Merges per-collection result lists into one list of at most `k`
/// documents sorted by ascending distance. Ties keep the order of the
/// inputs: earlier lists first, then each list's own order.
pub fn merge<I>(result_sets: I, k: usize) -> Vec<ScoredDocument>
where
    I: IntoIterator<Item = Vec<ScoredDocument>>,
{
    let mut merged: Vec<ScoredDocument> = result_sets.into_iter().flatten().collect();
    merged.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    merged.truncate(k);
    merged
}

/// Like [`merge`], but skips the collections whose query failed.
pub fn merge_partial<I>(results: I, k: usize) -> Vec<ScoredDocument>
where
    I: IntoIterator<Item = RetrievalResult<Vec<ScoredDocument>>>,
{
    let succeeded = results.into_iter().filter_map(|result| match result {
        Ok(documents) => Some(documents),
        Err(e) => {
            warn!("Dropping collection from merge: {}", e);
            None
        }
    });
    merge(succeeded, k)
}

/// Queries every collection concurrently and merges whatever succeeded.
pub async fn query_collections(
    index: &dyn VectorIndex,
    collection_names: &[String],
    query: &str,
    k: usize,
) -> Vec<ScoredDocument> {
    let tasks = collection_names
        .iter()
        .map(|name| index.query(name, query, k));
    let results = join_all(tasks).await;
    debug!(
        "Queried {} collections, {} succeeded",
        collection_names.len(),
        results.iter().filter(|r| r.is_ok()).count()
    );
    merge_partial(results, k)
}

/// Column-oriented response shape: one inner list per query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryResponse {
    pub ids: Vec<Vec<String>>,
    pub distances: Vec<Vec<f32>>,
    pub metadatas: Vec<Vec<Metadata>>,
    pub documents: Vec<Vec<String>>,
    pub embeddings: Option<Value>,
    pub uris: Option<Value>,
    pub data: Option<Value>,
}

impl From<Vec<ScoredDocument>> for QueryResponse {
    fn from(documents: Vec<ScoredDocument>) -> Self {
        let mut ids = Vec::with_capacity(documents.len());
        let mut distances = Vec::with_capacity(documents.len());
        let mut metadatas = Vec::with_capacity(documents.len());
        let mut texts = Vec::with_capacity(documents.len());
        for document in documents {
            ids.push(document.id);
            distances.push(document.distance);
            metadatas.push(document.metadata);
            texts.push(document.text);
        }
        Self {
            ids: vec![ids],
            distances: vec![distances],
            metadatas: vec![metadatas],
            documents: vec![texts],
            embeddings: None,
            uris: None,
            data: None,
        }
    }
}
