use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ObjectInfo, ObjectSink, ObjectStore, ObjectWriter};
use crate::error::StoreError;

/// Objects being written; never listed.
const STAGING_DIR: &str = ".staging";

/// Object store backed by a local (or network-mounted) directory.
#[derive(Clone, Debug)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && !name.contains(['\\', '\0'])
        && name
            .split('/')
            .all(|part| !part.is_empty() && !part.starts_with('.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

fn walk(root: &Path) -> io::Result<Vec<ObjectInfo>> {
    fn visit(root: &Path, dir: &Path, out: &mut Vec<ObjectInfo>) -> io::Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if dir == root && entry.file_name() == STAGING_DIR {
                continue;
            }
            if file_type.is_dir() {
                visit(root, &path, out)?;
            } else if file_type.is_file()
                && let Ok(relative) = path.strip_prefix(root)
            {
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(ObjectInfo {
                    name,
                    size: entry.metadata()?.len(),
                });
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    visit(root, root, &mut out)?;
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// Remove now-empty directories between `path` and `root`.
fn prune_empty_parents(root: &Path, path: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        if fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

fn remove_object(root: &Path, path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            prune_empty_parents(root, path);
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

async fn blocking<T, F>(job: F) -> Result<T, StoreError>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|err| StoreError::Io(io::Error::other(err)))?
        .map_err(StoreError::from)
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn create(&self, name: &str) -> Result<ObjectWriter, StoreError> {
        let dest = self.resolve(name)?;
        let staging = self.root.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging).await?;
        let tmp = staging.join(Uuid::new_v4().simple().to_string());
        let file = tokio::fs::File::create(&tmp).await?;
        Ok(ObjectWriter::new(
            name,
            Box::new(FsSink {
                file: Some(file),
                tmp,
                dest,
                committed: false,
            }),
        ))
    }

    async fn local_path(&self, name: &str) -> Result<Option<PathBuf>, StoreError> {
        let path = self.resolve(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(path)),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.resolve(name)?;
        let root = self.root.clone();
        blocking(move || remove_object(&root, &path)).await
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let removed = blocking(move || {
            let mut removed = 0;
            for object in walk(&root)? {
                if object.name.starts_with(&prefix)
                    && remove_object(&root, &root.join(&object.name))?
                {
                    removed += 1;
                }
            }
            Ok(removed)
        })
        .await?;
        debug!(removed, "deleted objects by prefix");
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<ObjectInfo>, StoreError> {
        let root = self.root.clone();
        blocking(move || walk(&root)).await
    }
}

struct FsSink {
    file: Option<tokio::fs::File>,
    tmp: PathBuf,
    dest: PathBuf,
    committed: bool,
}

#[async_trait]
impl ObjectSink for FsSink {
    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), StoreError> {
        let file = self.file.as_mut().ok_or_else(|| {
            StoreError::Io(io::Error::other("object writer already committed"))
        })?;
        file.write_all(bytes).await?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        if let Some(parent) = self.dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&self.tmp, &self.dest).await?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for FsSink {
    fn drop(&mut self) {
        if !self.committed
            && let Err(err) = fs::remove_file(&self.tmp)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.tmp.display(), "failed to discard staged object: {err}");
        }
    }
}
