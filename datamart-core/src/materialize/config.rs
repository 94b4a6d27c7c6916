use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// 10 GB.
pub const DEFAULT_DOWNLOAD_SIZE_LIMIT: u64 = 10_000_000_000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding cache entries; may be shared by several processes.
    pub root: PathBuf,
    /// Permanent shared storage written by discoverers.
    pub permanent_root: PathBuf,
    /// Abort downloads past this many bytes. `None` disables the check.
    pub download_size_limit: Option<u64>,
    pub http_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/cache/datasets"),
            permanent_root: PathBuf::from("/datasets"),
            download_size_limit: Some(DEFAULT_DOWNLOAD_SIZE_LIMIT),
            http_timeout_secs: 300,
        }
    }
}

impl CacheConfig {
    /// Both roots under one directory; convenient for tests and local runs.
    pub fn under(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            root: base.join("cache"),
            permanent_root: base.join("datasets"),
            ..Self::default()
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
