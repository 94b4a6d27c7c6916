//! Object storage for permanent dataset copies.

mod fs;
mod name;
mod permanent;

use std::{fmt, path::PathBuf};

use async_trait::async_trait;

use crate::error::StoreError;

pub use fs::FsObjectStore;
pub use name::{MAX_PLAIN_NAME_LEN, dataset_name};
pub use permanent::{CANONICAL_FILE, PermanentStorage};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
}

/// Object store client. Names are `/`-separated relative paths.
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug + 'static {
    /// Open an object for writing. Nothing is visible under `name` until the
    /// writer is committed.
    async fn create(&self, name: &str) -> Result<ObjectWriter, StoreError>;

    /// A readable local path for the object, if it exists.
    async fn local_path(&self, name: &str) -> Result<Option<PathBuf>, StoreError>;

    /// Returns whether the object existed.
    async fn delete(&self, name: &str) -> Result<bool, StoreError>;

    /// Delete every object whose name starts with `prefix`. Returns how many
    /// were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError>;

    async fn list(&self) -> Result<Vec<ObjectInfo>, StoreError>;
}

/// Backend half of an [`ObjectWriter`].
#[async_trait]
pub trait ObjectSink: Send {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), StoreError>;

    /// Publish the object. Dropping a sink without committing discards it.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

pub struct ObjectWriter {
    name: String,
    sink: Box<dyn ObjectSink>,
    written: u64,
}

impl ObjectWriter {
    pub fn new(name: impl Into<String>, sink: Box<dyn ObjectSink>) -> Self {
        Self {
            name: name.into(),
            sink,
            written: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        self.sink.write_all(bytes).await?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Returns the number of bytes written.
    pub async fn commit(self) -> Result<u64, StoreError> {
        self.sink.commit().await?;
        Ok(self.written)
    }
}

impl fmt::Debug for ObjectWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectWriter")
            .field("name", &self.name)
            .field("written", &self.written)
            .finish()
    }
}
