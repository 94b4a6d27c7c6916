use std::{
    fs::{File, OpenOptions, TryLockError},
    io,
    path::{Path, PathBuf},
};

use crate::error::CacheError;

/// Advisory lock on a cache entry, shared between processes using the same
/// cache root. Released when dropped.
///
/// Readers hold a shared lock for as long as they use an entry; builders and
/// purges take the exclusive lock.
#[derive(Debug)]
pub struct EntryLock {
    _file: File,
    path: PathBuf,
    exclusive: bool,
}

fn open(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

impl EntryLock {
    pub async fn exclusive(path: PathBuf) -> Result<Self, CacheError> {
        Self::acquire(path, true).await
    }

    pub async fn shared(path: PathBuf) -> Result<Self, CacheError> {
        Self::acquire(path, false).await
    }

    /// Exclusive lock, or `None` if anyone holds the entry.
    pub fn try_exclusive(path: PathBuf) -> Result<Option<Self>, CacheError> {
        let file = open(&path)?;
        match file.try_lock() {
            Ok(()) => Ok(Some(Self {
                _file: file,
                path,
                exclusive: true,
            })),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Error(err)) => Err(err.into()),
        }
    }

    async fn acquire(path: PathBuf, exclusive: bool) -> Result<Self, CacheError> {
        // Blocking wait; kept off the scheduler and off the bounded worker
        // pool so lock waiters cannot starve conversions.
        tokio::task::spawn_blocking(move || {
            let file = open(&path)?;
            if exclusive {
                file.lock()?;
            } else {
                file.lock_shared()?;
            }
            Ok(Self {
                _file: file,
                path,
                exclusive,
            })
        })
        .await
        .map_err(|err| CacheError::Task(err.to_string()))?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn shared_locks_coexist_and_exclude_writers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("k.lock");

        let a = EntryLock::shared(path.clone()).await.unwrap();
        let _b = EntryLock::shared(path.clone()).await.unwrap();
        assert!(EntryLock::try_exclusive(path.clone()).unwrap().is_none());

        drop(a);
        drop(_b);
        let held = EntryLock::try_exclusive(path.clone()).unwrap();
        assert!(held.as_ref().is_some_and(EntryLock::is_exclusive));

        let waiter = tokio::spawn(EntryLock::shared(path.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "shared lock waits for the writer");
        drop(held);
        waiter.await.unwrap().unwrap();
    }
}
