use std::{
    fs::File,
    io::Read,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use datamart_core::{
    error::{CacheError, FetchError},
    discovery::WorkerPool,
    materialize::{
        CacheStore, DatasetFetcher, MaterializationCache, PathOrigin, WriterRegistry,
    },
    storage::PermanentStorage,
};
use datamart_model::{
    DatasetId, DatasetMetadata, FormatOptions, MaterializeDescriptor, OutputFormat,
};
use serde_json::json;
use tempfile::TempDir;

const CSV: &[u8] = b"id,lat,long\n1,40.7,-74.0\n2,34.0,-118.2\n";

/// Writes [`CSV`] after a short delay and counts how often it is asked.
#[derive(Debug, Default)]
struct CountingFetcher {
    calls: AtomicUsize,
}

impl CountingFetcher {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatasetFetcher for CountingFetcher {
    async fn fetch(
        &self,
        _id: &DatasetId,
        _metadata: &DatasetMetadata,
        destination: &Path,
    ) -> Result<(), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::fs::write(destination, CSV).await?;
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    fetcher: Arc<CountingFetcher>,
    permanent: PermanentStorage,
    cache: MaterializationCache,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(CountingFetcher::default());
    let permanent = PermanentStorage::on_disk(dir.path().join("datasets"));
    let cache = MaterializationCache::new(
        CacheStore::new(dir.path().join("cache")),
        permanent.clone(),
        fetcher.clone(),
        WriterRegistry::with_defaults(),
        WorkerPool::new(2),
    );
    Harness {
        _dir: dir,
        fetcher,
        permanent,
        cache,
    }
}

fn remote_dataset() -> (DatasetId, DatasetMetadata) {
    let id = DatasetId::from_full("datamart.test.remote").unwrap();
    let mut metadata = DatasetMetadata::new()
        .with_name("remote")
        .with_field(
            "columns",
            json!([
                {"name": "id", "structural_type": "http://schema.org/Integer"},
                {"name": "lat", "structural_type": "http://schema.org/Float"},
                {"name": "long", "structural_type": "http://schema.org/Float"},
            ]),
        );
    metadata.set_materialize(MaterializeDescriptor::direct_url("http://example.org/x.csv"));
    (id, metadata)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_download_once() {
    let h = harness();
    let (id, metadata) = remote_dataset();

    let requests = (0..10).map(|_| {
        let cache = h.cache.clone();
        let id = id.clone();
        let metadata = metadata.clone();
        tokio::spawn(async move {
            let path = cache
                .get_dataset(&metadata, &id, &OutputFormat::csv(), &FormatOptions::new())
                .await
                .unwrap();
            std::fs::read(path.path()).unwrap()
        })
    });
    for bytes in futures::future::join_all(requests).await {
        assert_eq!(bytes.unwrap(), CSV);
    }
    assert_eq!(h.fetcher.calls(), 1);
    assert_eq!(h.cache.stats().await.unwrap().entries, 1);
}

#[tokio::test]
async fn conversions_reuse_the_canonical_download() {
    let h = harness();
    let (id, metadata) = remote_dataset();

    let csv = h
        .cache
        .get_dataset(&metadata, &id, &OutputFormat::csv(), &FormatOptions::new())
        .await
        .unwrap();
    assert_eq!(csv.origin(), PathOrigin::Cache);

    let d3m = h
        .cache
        .get_dataset(&metadata, &id, &OutputFormat::d3m(), &FormatOptions::new())
        .await
        .unwrap();
    // Explicit defaults hit the same derived entry.
    let again = h
        .cache
        .get_dataset(
            &metadata,
            &id,
            &OutputFormat::d3m(),
            &FormatOptions::new().with("version", json!("4.0.0")),
        )
        .await
        .unwrap();
    assert_eq!(d3m.path(), again.path());

    assert_eq!(h.fetcher.calls(), 1);
    assert_eq!(h.cache.stats().await.unwrap().entries, 2);

    assert!(d3m.path().is_file());
    let mut zip = zip::ZipArchive::new(File::open(d3m.path()).unwrap()).unwrap();
    let mut doc = String::new();
    zip.by_name("datasetDoc.json")
        .unwrap()
        .read_to_string(&mut doc)
        .unwrap();
    let doc: serde_json::Value = serde_json::from_str(&doc).unwrap();
    assert_eq!(doc["about"]["datasetID"], "datamart.test.remote");
    assert_eq!(doc["dataResources"][0]["columns"][0]["colType"], "integer");

    let mut data = Vec::new();
    zip.by_name("tables/learningData.csv")
        .unwrap()
        .read_to_end(&mut data)
        .unwrap();
    assert_eq!(data, CSV);
}

#[tokio::test]
async fn different_options_are_different_entries() {
    let h = harness();
    let (id, metadata) = remote_dataset();

    let v4 = h
        .cache
        .get_dataset(&metadata, &id, &OutputFormat::d3m(), &FormatOptions::new())
        .await
        .unwrap();
    let v3 = h
        .cache
        .get_dataset(
            &metadata,
            &id,
            &OutputFormat::d3m(),
            &FormatOptions::new().with("version", json!("3.2.0")),
        )
        .await
        .unwrap();
    assert_ne!(v4.path(), v3.path());
    assert_eq!(h.fetcher.calls(), 1);
}

#[tokio::test]
async fn bad_requests_fail_before_fetching() {
    let h = harness();
    let (id, metadata) = remote_dataset();

    let err = h
        .cache
        .get_dataset(&metadata, &id, &OutputFormat::new("parquet").unwrap(), &FormatOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::UnknownFormat(_)));
    assert!(err.is_client_error());

    let err = h
        .cache
        .get_dataset(
            &metadata,
            &id,
            &OutputFormat::d3m(),
            &FormatOptions::new().with("version", json!("9.9.9")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidFormatOptions(_)));

    let err = h
        .cache
        .get_dataset(
            &metadata,
            &id,
            &OutputFormat::csv(),
            &FormatOptions::new().with("delimiter", json!(";")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidFormatOptions(_)));

    assert_eq!(h.fetcher.calls(), 0);
}

#[tokio::test]
async fn permanent_storage_is_served_in_place() {
    let h = harness();
    let id = DatasetId::from_full("datamart.test.geo").unwrap();
    let mut writer = h.permanent.create(&id).await.unwrap();
    writer.write_all(CSV).await.unwrap();
    writer.commit().await.unwrap();

    let mut metadata = DatasetMetadata::new().with_name("geo");
    metadata.set_materialize(MaterializeDescriptor::shared_storage());

    let csv = h
        .cache
        .get_dataset(&metadata, &id, &OutputFormat::csv(), &FormatOptions::new())
        .await
        .unwrap();
    assert_eq!(csv.origin(), PathOrigin::PermanentStorage);
    assert_eq!(std::fs::read(csv.path()).unwrap(), CSV);

    let d3m = h
        .cache
        .get_dataset(&metadata, &id, &OutputFormat::d3m(), &FormatOptions::new())
        .await
        .unwrap();
    assert_eq!(d3m.origin(), PathOrigin::Cache);
    assert_eq!(h.fetcher.calls(), 0);
    // Only the derived entry is cached.
    assert_eq!(h.cache.stats().await.unwrap().entries, 1);
}

#[tokio::test]
async fn purged_datasets_are_fetched_again() {
    let h = harness();
    let (id, metadata) = remote_dataset();

    let first = h
        .cache
        .get_dataset(&metadata, &id, &OutputFormat::d3m(), &FormatOptions::new())
        .await
        .unwrap();
    drop(first);
    assert_eq!(h.cache.purge_dataset(&id).await.unwrap(), 2);
    assert_eq!(h.cache.stats().await.unwrap().entries, 0);

    let csv = h
        .cache
        .get_dataset(&metadata, &id, &OutputFormat::csv(), &FormatOptions::new())
        .await
        .unwrap();
    assert_eq!(std::fs::read(csv.path()).unwrap(), CSV);
    assert_eq!(h.fetcher.calls(), 2);
}

#[tokio::test]
async fn failed_fetch_leaves_nothing_behind() {
    let h = harness();
    let id = DatasetId::from_full("datamart.test.nowhere").unwrap();
    let metadata = DatasetMetadata::new();
    let cache = MaterializationCache::new(
        h.cache.store().clone(),
        h.permanent.clone(),
        Arc::new(datamart_core::materialize::DescriptorFetcher::new(
            datamart_core::materialize::HttpFetcher::new(Duration::from_secs(1), None).unwrap(),
        )),
        WriterRegistry::with_defaults(),
        WorkerPool::new(1),
    );

    let err = cache
        .get_dataset(&metadata, &id, &OutputFormat::csv(), &FormatOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Fetch(FetchError::InvalidDescriptor(_))));
    assert_eq!(cache.stats().await.unwrap().entries, 0);
    assert_eq!(cache.open().await.unwrap(), 0, "no stale temporaries");
}

#[tokio::test]
async fn long_dataset_ids_convert_and_purge() {
    let h = harness();
    let (_, metadata) = remote_dataset();
    let id = DatasetId::from_full(format!(
        "datamart.zenodo.{}{}",
        "数据集".repeat(5),
        "a".repeat(150)
    ))
    .unwrap();
    let (neighbour, _) = remote_dataset();

    let d3m = h
        .cache
        .get_dataset(&metadata, &id, &OutputFormat::d3m(), &FormatOptions::new())
        .await
        .unwrap();
    assert!(d3m.path().is_file());
    assert!(d3m.path().file_name().unwrap().len() < 255);
    drop(d3m);
    h.cache
        .get_dataset(&metadata, &neighbour, &OutputFormat::csv(), &FormatOptions::new())
        .await
        .unwrap();
    assert_eq!(h.fetcher.calls(), 2);

    assert_eq!(h.cache.purge_dataset(&id).await.unwrap(), 2);
    assert_eq!(h.cache.stats().await.unwrap().entries, 1);
}
