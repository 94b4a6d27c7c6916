//! Search and similarity index clients, and deletion across them.

mod bridge;

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use datamart_model::DatasetId;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::IndexError;

pub use bridge::{DeletionReport, IdentityIndexBridge};

/// Full-text/metadata search index, keyed by dataset id.
#[async_trait]
pub trait SearchIndex: Send + Sync + fmt::Debug + 'static {
    async fn upsert(&self, id: &DatasetId, document: Value) -> Result<(), IndexError>;

    /// Returns whether a document was present.
    async fn delete(&self, id: &DatasetId) -> Result<bool, IndexError>;
}

/// Index of column sketches used for similarity search.
#[async_trait]
pub trait SimilarityIndex: Send + Sync + fmt::Debug + 'static {
    async fn index_sketch(&self, id: &DatasetId, sketch: Value) -> Result<(), IndexError>;

    /// Returns whether a sketch was present.
    async fn delete(&self, id: &DatasetId) -> Result<bool, IndexError>;
}

#[derive(Debug, Default)]
pub struct MemorySearchIndex {
    documents: Mutex<HashMap<DatasetId, Value>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &DatasetId) -> Option<Value> {
        self.documents.lock().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &DatasetId) -> bool {
        self.documents.lock().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.lock().await.is_empty()
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn upsert(&self, id: &DatasetId, document: Value) -> Result<(), IndexError> {
        self.documents.lock().await.insert(id.clone(), document);
        Ok(())
    }

    async fn delete(&self, id: &DatasetId) -> Result<bool, IndexError> {
        Ok(self.documents.lock().await.remove(id).is_some())
    }
}

#[derive(Debug, Default)]
pub struct MemorySimilarityIndex {
    sketches: Mutex<HashMap<DatasetId, Value>>,
}

impl MemorySimilarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, id: &DatasetId) -> bool {
        self.sketches.lock().await.contains_key(id)
    }
}

#[async_trait]
impl SimilarityIndex for MemorySimilarityIndex {
    async fn index_sketch(&self, id: &DatasetId, sketch: Value) -> Result<(), IndexError> {
        self.sketches.lock().await.insert(id.clone(), sketch);
        Ok(())
    }

    async fn delete(&self, id: &DatasetId) -> Result<bool, IndexError> {
        Ok(self.sketches.lock().await.remove(id).is_some())
    }
}
