use std::{
    collections::HashMap,
    fmt,
    future::Future,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use datamart_model::{DatasetId, DatasetMetadata, FormatOptions, OutputFormat};
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use tracing::{debug, info, warn};

use super::{
    archive,
    config::CacheConfig,
    fetch::{DatasetFetcher, DescriptorFetcher, HttpFetcher},
    key::CacheKey,
    lock::EntryLock,
    store::{CacheStats, CacheStore},
    writer::{FormatWriter, WriteRequest, WriterRegistry},
};
use crate::{discovery::WorkerPool, error::CacheError, storage::PermanentStorage};

type SharedBuild = Shared<BoxFuture<'static, Result<(), CacheError>>>;
type InFlight = Arc<Mutex<HashMap<CacheKey, SharedBuild>>>;

/// Where a [`ScopedPath`] points.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathOrigin {
    PermanentStorage,
    Cache,
}

/// Read-only path to materialized bytes. While any clone is alive the
/// cache entry it points at cannot be purged. Do not modify or delete the
/// file.
#[derive(Clone, Debug)]
pub struct ScopedPath {
    path: PathBuf,
    origin: PathOrigin,
    _guard: Option<Arc<EntryLock>>,
}

impl ScopedPath {
    fn permanent(path: PathBuf) -> Self {
        Self {
            path,
            origin: PathOrigin::PermanentStorage,
            _guard: None,
        }
    }

    fn cached(path: PathBuf, lock: EntryLock) -> Self {
        Self {
            path,
            origin: PathOrigin::Cache,
            _guard: Some(Arc::new(lock)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn origin(&self) -> PathOrigin {
        self.origin
    }
}

impl AsRef<Path> for ScopedPath {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Counters since construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheActivity {
    pub hits: u64,
    pub builds: u64,
    pub joined: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    builds: AtomicU64,
    joined: AtomicU64,
    failures: AtomicU64,
}

/// Removes a key from the in-flight map when its build task ends, including
/// by panic.
struct FlightGuard {
    in_flight: InFlight,
    key: CacheKey,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Two-tier materialization cache.
///
/// The canonical tier holds each dataset's CSV as fetched from its source;
/// the derived tier holds conversions of that CSV, one entry per format and
/// option set. Each key is built at most once at a time across every
/// process sharing the cache root: in process through a shared build
/// future, across processes through the entry's exclusive file lock.
#[derive(Clone)]
pub struct MaterializationCache {
    store: CacheStore,
    permanent: PermanentStorage,
    fetcher: Arc<dyn DatasetFetcher>,
    writers: WriterRegistry,
    pool: WorkerPool,
    in_flight: InFlight,
    counters: Arc<Counters>,
}

impl fmt::Debug for MaterializationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self
            .in_flight
            .try_lock()
            .map(|guard| guard.len())
            .unwrap_or(0);

        f.debug_struct("MaterializationCache")
            .field("root", &self.store.root())
            .field("permanent", &self.permanent)
            .field("fetcher", &self.fetcher)
            .field("formats", &self.writers.formats())
            .field("pool", &self.pool)
            .field("in_flight_builds", &in_flight)
            .field("activity", &self.activity())
            .finish()
    }
}

impl MaterializationCache {
    pub fn new(
        store: CacheStore,
        permanent: PermanentStorage,
        fetcher: Arc<dyn DatasetFetcher>,
        writers: WriterRegistry,
        pool: WorkerPool,
    ) -> Self {
        Self {
            store,
            permanent,
            fetcher,
            writers,
            pool,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Cache with the HTTP/descriptor fetcher and the built-in writers.
    pub fn from_config(config: &CacheConfig, pool: WorkerPool) -> Result<Self, CacheError> {
        let http = HttpFetcher::new(config.http_timeout(), config.download_size_limit)?;
        Ok(Self::new(
            CacheStore::new(&config.root),
            PermanentStorage::on_disk(&config.permanent_root),
            Arc::new(DescriptorFetcher::new(http)),
            WriterRegistry::with_defaults(),
            pool,
        ))
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn permanent(&self) -> &PermanentStorage {
        &self.permanent
    }

    pub fn writers(&self) -> &WriterRegistry {
        &self.writers
    }

    /// Create the cache directories and remove temporaries left by
    /// builders that died.
    pub async fn open(&self) -> Result<usize, CacheError> {
        self.store.ensure_dirs().await?;
        self.store.sweep_stale_temps().await
    }

    pub fn activity(&self) -> CacheActivity {
        CacheActivity {
            hits: self.counters.hits.load(Ordering::Relaxed),
            builds: self.counters.builds.load(Ordering::Relaxed),
            joined: self.counters.joined.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        self.store.stats().await
    }

    /// Local path to `dataset_id` in `format`, materializing and converting
    /// as needed.
    pub async fn get_dataset(
        &self,
        metadata: &DatasetMetadata,
        dataset_id: &DatasetId,
        format: &OutputFormat,
        format_options: &FormatOptions,
    ) -> Result<ScopedPath, CacheError> {
        info!(
            dataset_id = %dataset_id,
            size = ?metadata.size(),
            format = %format,
            "Getting dataset"
        );

        // Reject bad requests before anything is downloaded.
        let conversion = if format.is_csv() {
            if !format_options.is_empty() {
                return Err(CacheError::InvalidFormatOptions(
                    "csv output takes no options".into(),
                ));
            }
            None
        } else {
            let writer = self
                .writers
                .get(format)
                .ok_or_else(|| CacheError::UnknownFormat(format.to_string()))?;
            let options = format_options.merged_over(&writer.default_options());
            writer
                .validate_options(&options)
                .map_err(|err| CacheError::InvalidFormatOptions(err.to_string()))?;
            let key = CacheKey::derived(dataset_id, format, &options)?;
            Some((writer, options, key))
        };

        let canonical = self.canonical(metadata, dataset_id).await?;
        let Some((writer, options, key)) = conversion else {
            return Ok(canonical);
        };

        let pool = self.pool.clone();
        let id = dataset_id.clone();
        let metadata = metadata.clone();
        self.obtain_or_build(&key, move |temp| async move {
            info!(dataset_id = %id, format = %writer.format(), ?options, "Converting CSV");
            pool.run(move || convert(writer.as_ref(), &id, &metadata, &options, &canonical, &temp))
                .await?
        })
        .await
    }

    async fn canonical(
        &self,
        metadata: &DatasetMetadata,
        dataset_id: &DatasetId,
    ) -> Result<ScopedPath, CacheError> {
        if let Some(path) = self.permanent.canonical_path(dataset_id).await? {
            info!(dataset_id = %dataset_id, "Reading from permanent storage");
            return Ok(ScopedPath::permanent(path));
        }

        let key = CacheKey::canonical(dataset_id)?;
        let fetcher = Arc::clone(&self.fetcher);
        let id = dataset_id.clone();
        let metadata = metadata.clone();
        self.obtain_or_build(&key, move |temp| async move {
            info!(dataset_id = %id, "Materializing CSV");
            fetcher
                .fetch(&id, &metadata, &temp)
                .await
                .map_err(CacheError::from)
        })
        .await
    }

    /// Ready entry for `key`, building it with `builder` if absent.
    ///
    /// The builder is handed a temporary path and must leave a regular file
    /// there; it is committed only if the builder succeeds. Callers that
    /// arrive while a build of the same key is running wait for it and share
    /// its outcome. Failures are not remembered: the next caller builds
    /// again.
    pub async fn obtain_or_build<B, Fut>(
        &self,
        key: &CacheKey,
        builder: B,
    ) -> Result<ScopedPath, CacheError>
    where
        B: FnOnce(PathBuf) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<(), CacheError>> + Send + 'static,
    {
        let mut first_look = true;
        loop {
            if let Some(handle) = self.ready_handle(key).await? {
                if first_look {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "cache hit");
                }
                return Ok(handle);
            }
            first_look = false;
            self.join_or_lead(key, builder.clone()).await?;
        }
    }

    async fn ready_handle(&self, key: &CacheKey) -> Result<Option<ScopedPath>, CacheError> {
        if !self.store.is_ready(key).await? {
            return Ok(None);
        }
        let lock = self.store.lock_shared(key).await?;
        // Purged while we waited for the lock.
        if !self.store.is_ready(key).await? {
            return Ok(None);
        }
        Ok(Some(ScopedPath::cached(self.store.entry_path(key), lock)))
    }

    fn join_or_lead<B, Fut>(&self, key: &CacheKey, builder: B) -> SharedBuild
    where
        B: FnOnce(PathBuf) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), CacheError>> + Send + 'static,
    {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(flight) = in_flight.get(key) {
            let joined = self.counters.joined.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(key = %key, joined, "singleflight wait");
            return flight.clone();
        }

        // The guard takes the map lock on drop, so it cannot remove the key
        // before it is inserted below.
        let guard = FlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            key: key.clone(),
        };
        let store = self.store.clone();
        let counters = Arc::clone(&self.counters);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let _guard = guard;
            build_entry(&store, &task_key, builder, &counters).await
        });
        let flight = async move {
            match task.await {
                Ok(result) => result,
                Err(err) => Err(CacheError::Task(err.to_string())),
            }
        }
        .boxed()
        .shared();
        in_flight.insert(key.clone(), flight.clone());
        debug!(key = %key, "singleflight lead");
        flight
    }

    /// Purge every cache entry of a dataset, canonical and derived. Waits
    /// for readers of each entry to finish.
    pub async fn purge_dataset(&self, dataset_id: &DatasetId) -> Result<usize, CacheError> {
        let purged = self
            .store
            .purge_prefix(&CacheKey::dataset_prefix(dataset_id))
            .await?;
        info!(dataset_id = %dataset_id, purged, "purged cached copies");
        Ok(purged)
    }

    /// Purge every entry.
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let purged = self.store.purge_prefix("").await?;
        info!(purged, "cache cleared");
        Ok(purged)
    }
}

async fn build_entry<B, Fut>(
    store: &CacheStore,
    key: &CacheKey,
    builder: B,
    counters: &Counters,
) -> Result<(), CacheError>
where
    B: FnOnce(PathBuf) -> Fut,
    Fut: Future<Output = Result<(), CacheError>>,
{
    let _lock = store.lock_exclusive(key).await?;
    if store.is_ready(key).await? {
        debug!(key = %key, "entry built by another process");
        return Ok(());
    }

    let temp = store.temp_path(key);
    let result = match builder(temp.clone()).await {
        Ok(()) => store.commit(&temp, key).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(bytes) => {
            counters.builds.fetch_add(1, Ordering::Relaxed);
            info!(key = %key, bytes, "cache entry committed");
            Ok(())
        }
        Err(err) => {
            store.discard(&temp).await;
            counters.failures.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, "cache build failed: {err}");
            Err(err)
        }
    }
}

fn convert(
    writer: &dyn FormatWriter,
    dataset_id: &DatasetId,
    metadata: &DatasetMetadata,
    options: &FormatOptions,
    source: &ScopedPath,
    destination: &Path,
) -> Result<(), CacheError> {
    writer.write(&WriteRequest {
        dataset_id,
        metadata,
        options,
        source: source.path(),
        destination,
    })?;
    archive::package_if_directory(destination)?;
    Ok(())
}
