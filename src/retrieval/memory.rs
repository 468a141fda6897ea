//! In-process vector index used when no external index is configured.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use tracing::{debug, info};

use super::{Metadata, RetrievalError, RetrievalResult, ScoredDocument, VectorIndex};

pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Feature-hashing embedder: each lower-cased alphanumeric token adds one to
/// a hashed bucket, and the vector is L2-normalised.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dim: usize,
}

impl HashEmbedder {
    pub const DEFAULT_DIM: usize = 384;

    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1) }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIM)
    }
}

impl Embedder for HashEmbedder {
    fn dim(&self) -> usize {
        self.dim
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            token.to_lowercase().hash(&mut hasher);
            let bucket = (hasher.finish() % self.dim as u64) as usize;
            vector[bucket] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

struct IndexedDocument {
    id: String,
    text: String,
    metadata: Metadata,
    embedding: Vec<f32>,
}

/// Collections of embedded documents held in memory. Distance is cosine
/// distance, `1 - cos(query, document)`.
pub struct InMemoryVectorIndex {
    embedder: Arc<dyn Embedder>,
    collections: DashMap<String, Vec<IndexedDocument>>,
}

impl InMemoryVectorIndex {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            collections: DashMap::new(),
        }
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.collections.iter().map(|c| c.key().clone()).collect()
    }
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new(Arc::new(HashEmbedder::default()))
    }
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    1.0 - dot
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn index(
        &self,
        collection: &str,
        texts: &[String],
        metadatas: &[Metadata],
        ids: &[String],
    ) -> RetrievalResult<()> {
        if texts.len() != metadatas.len() || texts.len() != ids.len() {
            return Err(RetrievalError::MismatchedInput {
                texts: texts.len(),
                metadatas: metadatas.len(),
                ids: ids.len(),
            });
        }

        match self.collections.entry(collection.to_string()) {
            Entry::Occupied(_) => {
                debug!("Collection {} already exists, skipping", collection);
            }
            Entry::Vacant(slot) => {
                let documents = texts
                    .iter()
                    .zip(metadatas)
                    .zip(ids)
                    .map(|((text, metadata), id)| IndexedDocument {
                        id: id.clone(),
                        text: text.clone(),
                        metadata: metadata.clone(),
                        embedding: self.embedder.embed(text),
                    })
                    .collect();
                slot.insert(documents);
                info!("Indexed {} chunks into {}", texts.len(), collection);
            }
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        query_text: &str,
        k: usize,
    ) -> RetrievalResult<Vec<ScoredDocument>> {
        let documents = self
            .collections
            .get(collection)
            .ok_or_else(|| RetrievalError::CollectionNotFound(collection.to_string()))?;

        let query = self.embedder.embed(query_text);
        let mut scored: Vec<ScoredDocument> = documents
            .iter()
            .map(|document| ScoredDocument {
                id: document.id.clone(),
                distance: cosine_distance(&query, &document.embedding),
                metadata: document.metadata.clone(),
                text: document.text.clone(),
            })
            .collect();
        scored.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        scored.truncate(k);
        Ok(scored)
    }

    async fn reset(&self) -> RetrievalResult<()> {
        self.collections.clear();
        info!("Vector index reset");
        Ok(())
    }
}
