use std::{path::PathBuf, sync::Arc};

use datamart_model::DatasetId;

use super::{FsObjectStore, ObjectStore, ObjectWriter, dataset_name};
use crate::error::StoreError;

/// File name of the canonical copy inside a dataset's directory.
pub const CANONICAL_FILE: &str = "main.csv";

/// Permanent shared storage: one directory per dataset (see
/// [`dataset_name`]) holding its canonical CSV. Content there is written once and never modified.
#[derive(Clone, Debug)]
pub struct PermanentStorage {
    store: Arc<dyn ObjectStore>,
}

impl PermanentStorage {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn on_disk(root: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FsObjectStore::new(root)))
    }

    pub fn object_name(id: &DatasetId) -> String {
        format!("{}/{CANONICAL_FILE}", dataset_name(id))
    }

    /// Path of the stored canonical copy, if there is one.
    pub async fn canonical_path(&self, id: &DatasetId) -> Result<Option<PathBuf>, StoreError> {
        self.store.local_path(&Self::object_name(id)).await
    }

    pub async fn create(&self, id: &DatasetId) -> Result<ObjectWriter, StoreError> {
        self.store.create(&Self::object_name(id)).await
    }

    /// Remove everything stored for `id`. Returns the number of objects
    /// deleted.
    pub async fn remove(&self, id: &DatasetId) -> Result<usize, StoreError> {
        self.store
            .delete_prefix(&format!("{}/", dataset_name(id)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn stores_under_the_encoded_id() {
        let dir = TempDir::new().unwrap();
        let storage = PermanentStorage::on_disk(dir.path());
        let id = DatasetId::from_full("datamart.test.a_b").unwrap();

        let mut writer = storage.create(&id).await.unwrap();
        writer.write_all(b"name\nx\n").await.unwrap();
        writer.commit().await.unwrap();

        let path = storage.canonical_path(&id).await.unwrap().unwrap();
        assert_eq!(path, dir.path().join("datamart.test.a%5Fb/main.csv"));
        assert_eq!(storage.remove(&id).await.unwrap(), 1);
        assert!(storage.canonical_path(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn long_ids_fit_in_one_directory_name() {
        let dir = TempDir::new().unwrap();
        let storage = PermanentStorage::on_disk(dir.path());
        let id = DatasetId::from_full(format!("datamart.test.{}", "数据".repeat(60))).unwrap();
        assert!(id.encoded().len() > 255);

        let mut writer = storage.create(&id).await.unwrap();
        writer.write_all(b"name\nx\n").await.unwrap();
        writer.commit().await.unwrap();

        let path = storage.canonical_path(&id).await.unwrap().unwrap();
        assert_eq!(path, dir.path().join(dataset_name(&id)).join(CANONICAL_FILE));
        assert_eq!(storage.remove(&id).await.unwrap(), 1);
    }
}
