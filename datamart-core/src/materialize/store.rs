use std::{
    io,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{key::CacheKey, lock::EntryLock};
use crate::error::CacheError;

const LOCKS_DIR: &str = ".locks";
const TEMP_DIR: &str = ".tmp";

/// Usage of the on-disk cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryInfo {
    pub key: String,
    pub bytes: u64,
}

/// Cache directory layout:
///
/// ```text
/// <root>/<key>              ready entries, never modified once there
/// <root>/.locks/<key>.lock  per-key advisory lock files, never removed
/// <root>/.tmp/<key>.<uuid>  entries being built
/// ```
///
/// An entry is ready exactly when its final path exists; builds publish by
/// renaming the temporary into place.
#[derive(Clone, Debug)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_dirs(&self) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(self.root.join(LOCKS_DIR)).await?;
        tokio::fs::create_dir_all(self.root.join(TEMP_DIR)).await?;
        Ok(())
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    pub fn lock_path(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(LOCKS_DIR)
            .join(format!("{}.lock", key.as_str()))
    }

    pub fn temp_path(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(TEMP_DIR)
            .join(format!("{}.{}", key.as_str(), Uuid::new_v4().simple()))
    }

    pub async fn is_ready(&self, key: &CacheKey) -> Result<bool, CacheError> {
        Ok(tokio::fs::try_exists(self.entry_path(key)).await?)
    }

    pub async fn lock_exclusive(&self, key: &CacheKey) -> Result<EntryLock, CacheError> {
        self.ensure_dirs().await?;
        EntryLock::exclusive(self.lock_path(key)).await
    }

    pub async fn lock_shared(&self, key: &CacheKey) -> Result<EntryLock, CacheError> {
        self.ensure_dirs().await?;
        EntryLock::shared(self.lock_path(key)).await
    }

    /// Publish a finished build. Caller holds the entry's exclusive lock.
    pub async fn commit(&self, temp: &Path, key: &CacheKey) -> Result<u64, CacheError> {
        let meta = tokio::fs::metadata(temp).await?;
        if !meta.is_file() {
            return Err(CacheError::Io(
                io::Error::other(format!(
                    "build output for {key} is not a regular file"
                ))
                .into(),
            ));
        }
        tokio::fs::rename(temp, self.entry_path(key)).await?;
        Ok(meta.len())
    }

    /// Remove a build's leftovers, file or directory.
    pub async fn discard(&self, temp: &Path) {
        let result = match tokio::fs::metadata(temp).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(temp).await,
            Ok(_) => tokio::fs::remove_file(temp).await,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!(path = %temp.display(), "failed to discard partial build: {err}");
        }
        // Writers that package a directory leave a sibling archive.
        let mut archive = temp.as_os_str().to_owned();
        archive.push(".zip");
        let _ = tokio::fs::remove_file(PathBuf::from(archive)).await;
    }

    /// Ready entries, sorted by key.
    pub async fn entries(&self) -> Result<Vec<EntryInfo>, CacheError> {
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry.metadata().await?;
            entries.push(EntryInfo {
                key: name,
                bytes: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let entries = self.entries().await?;
        Ok(CacheStats {
            entries: entries.len(),
            bytes: entries.iter().map(|e| e.bytes).sum(),
        })
    }

    /// Delete a ready entry once no reader or builder holds it. Returns
    /// whether it existed.
    pub async fn purge(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let _lock = self.lock_exclusive(key).await?;
        match tokio::fs::remove_file(self.entry_path(key)).await {
            Ok(()) => {
                debug!(key = %key, "cache entry purged");
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Purge every entry whose key starts with `prefix`.
    pub async fn purge_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut purged = 0;
        for entry in self.entries().await? {
            if !entry.key.starts_with(prefix) {
                continue;
            }
            let key = CacheKey::new(entry.key)?;
            if self.purge(&key).await? {
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Remove temporaries left behind by builders that died. A temporary is
    /// stale when nobody holds its key's lock.
    pub async fn sweep_stale_temps(&self) -> Result<usize, CacheError> {
        self.ensure_dirs().await?;
        let mut dir = tokio::fs::read_dir(self.root.join(TEMP_DIR)).await?;
        let mut removed = 0;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // `<key>.<uuid>` or `<key>.<uuid>.zip`; keys may contain dots.
            let stem = name.strip_suffix(".zip").unwrap_or(&name);
            let Some((key, _)) = stem.rsplit_once('.') else {
                continue;
            };
            let Ok(key) = CacheKey::new(key) else {
                continue;
            };
            let Some(_lock) = EntryLock::try_exclusive(self.lock_path(&key))? else {
                continue;
            };
            self.discard(&entry.path()).await;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "removed stale cache temporaries");
        }
        Ok(removed)
    }
}
