use std::{fmt, sync::Arc};

use datamart_model::DatasetId;
use tracing::{info, warn};

use super::{SearchIndex, SimilarityIndex};
use crate::{
    error::BridgeError,
    materialize::MaterializationCache,
    storage::PermanentStorage,
};

/// What a deletion removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeletionReport {
    pub search_document: bool,
    pub similarity_sketch: bool,
    pub cache_entries: usize,
    pub stored_objects: usize,
}

/// Removes a dataset from everywhere it lives, in an order that makes it
/// undiscoverable before its bytes go away: search index, similarity index,
/// cache entries (all tiers), then the permanent copy.
#[derive(Clone)]
pub struct IdentityIndexBridge {
    search: Arc<dyn SearchIndex>,
    similarity: Arc<dyn SimilarityIndex>,
    cache: MaterializationCache,
    storage: PermanentStorage,
}

impl fmt::Debug for IdentityIndexBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityIndexBridge")
            .field("search", &self.search)
            .field("similarity", &self.similarity)
            .field("cache_root", &self.cache.store().root())
            .field("storage", &self.storage)
            .finish()
    }
}

impl IdentityIndexBridge {
    pub fn new(
        search: Arc<dyn SearchIndex>,
        similarity: Arc<dyn SimilarityIndex>,
        cache: MaterializationCache,
        storage: PermanentStorage,
    ) -> Self {
        Self {
            search,
            similarity,
            cache,
            storage,
        }
    }

    /// Stops at the first failing step; earlier steps are not undone and the
    /// call can simply be retried.
    pub async fn delete_dataset(&self, id: &DatasetId) -> Result<DeletionReport, BridgeError> {
        let search_document =
            self.search
                .delete(id)
                .await
                .map_err(|source| BridgeError::SearchIndex {
                    id: id.to_string(),
                    source,
                })?;
        let similarity_sketch =
            self.similarity
                .delete(id)
                .await
                .map_err(|source| BridgeError::SimilarityIndex {
                    id: id.to_string(),
                    source,
                })?;
        let cache_entries =
            self.cache
                .purge_dataset(id)
                .await
                .map_err(|source| BridgeError::CachePurge {
                    id: id.to_string(),
                    source,
                })?;
        let stored_objects =
            self.storage
                .remove(id)
                .await
                .map_err(|source| BridgeError::StoragePurge {
                    id: id.to_string(),
                    source,
                })?;

        let report = DeletionReport {
            search_document,
            similarity_sketch,
            cache_entries,
            stored_objects,
        };
        if report == DeletionReport::default() {
            warn!(dataset_id = %id, "deleted dataset was not found anywhere");
        } else {
            info!(dataset_id = %id, ?report, "dataset deleted");
        }
        Ok(report)
    }
}
