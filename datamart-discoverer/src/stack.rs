//! Everything one process runs: the broker, cache, storage and indexes,
//! plus the example discoverer and the local profiler on top.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use datamart_config::Config;
use datamart_core::{
    bus::MemoryBroker,
    discovery::{DiscovererHandle, DiscoveryCoordinator, PROFILE_QUEUE, PluginCapabilities, WorkerPool},
    error::BusError,
    index::{IdentityIndexBridge, MemorySearchIndex, MemorySimilarityIndex},
    materialize::MaterializationCache,
    storage::PermanentStorage,
};
use datamart_model::DiscovererIdentity;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{example::ExampleDiscoverer, profiler::LocalProfiler};

#[derive(Debug)]
pub struct Stack {
    pub config: Config,
    pub identity: DiscovererIdentity,
    pub broker: MemoryBroker,
    pub cache: MaterializationCache,
    pub permanent: PermanentStorage,
    pub search: Arc<MemorySearchIndex>,
    pub bridge: IdentityIndexBridge,
}

impl Stack {
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let identity = DiscovererIdentity::new(config.identity.as_str())?;
        let cache = MaterializationCache::from_config(
            &config.cache,
            WorkerPool::new(config.discovery.worker_threads),
        )?;
        let swept = cache
            .open()
            .await
            .with_context(|| format!("failed to open cache at {}", config.cache.root.display()))?;
        if swept > 0 {
            info!(swept, "removed leftovers of interrupted builds");
        }

        let permanent = PermanentStorage::on_disk(&config.cache.permanent_root);
        let search = Arc::new(MemorySearchIndex::new());
        let bridge = IdentityIndexBridge::new(
            search.clone(),
            Arc::new(MemorySimilarityIndex::new()),
            cache.clone(),
            permanent.clone(),
        );
        Ok(Self {
            config,
            identity,
            broker: MemoryBroker::new(),
            cache,
            permanent,
            search,
            bridge,
        })
    }

    pub async fn start_discoverer(&self) -> Result<DiscovererHandle, BusError> {
        DiscoveryCoordinator::new(
            self.identity.clone(),
            Arc::new(self.broker.connect()),
            self.permanent.clone(),
        )
        .with_config(self.config.discovery.clone())
        .with_bridge(self.bridge.clone())
        .start(
            PluginCapabilities::new()
                .with_blocking_batch(ExampleDiscoverer)
                .with_queries(ExampleDiscoverer),
        )
        .await
    }

    /// The profile queue must already be declared.
    pub fn start_profiler(&self) -> JoinHandle<()> {
        let profiler = LocalProfiler::new(
            Arc::new(self.broker.connect()),
            self.cache.clone(),
            self.search.clone(),
        );
        tokio::spawn(async move {
            if let Err(err) = profiler.run().await {
                warn!("profiler stopped: {err:#}");
            }
        })
    }

    /// Wait until every queued profiling job has been handled.
    pub async fn profiling_settled(&self) {
        loop {
            let ready = self.broker.ready_count(PROFILE_QUEUE).unwrap_or(0);
            let unacked = self.broker.unacked_count(PROFILE_QUEUE).unwrap_or(0);
            if ready == 0 && unacked == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example::DATASET_ID;
    use datamart_core::{
        discovery::{QueryEvent, QuerySession},
        materialize::CacheConfig,
    };
    use serde_json::json;
    use tempfile::TempDir;

    async fn stack(dir: &TempDir) -> Stack {
        Stack::open(Config {
            cache: CacheConfig::under(dir.path()),
            ..Config::default()
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn batch_discovery_is_profiled_and_indexed() {
        let dir = TempDir::new().unwrap();
        let stack = stack(&dir).await;
        let mut discoverer = stack.start_discoverer().await.unwrap();
        let profiler = stack.start_profiler();

        discoverer.wait_batch().await;
        tokio::time::timeout(Duration::from_secs(5), stack.profiling_settled())
            .await
            .unwrap();

        let id = stack.identity.dataset_id(DATASET_ID).unwrap();
        let document = stack.search.get(&id).await.expect("indexed");
        assert_eq!(document["nb_rows"], 4);
        assert_eq!(document["name"], "Example CSV");
        assert_eq!(document["materialize"]["identifier"], "datamart.example");

        let report = stack.bridge.delete_dataset(&id).await.unwrap();
        assert!(report.search_document);
        assert_eq!(report.stored_objects, 1);

        discoverer.shutdown().await;
        profiler.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn matching_queries_get_the_example_back() {
        let dir = TempDir::new().unwrap();
        let stack = stack(&dir).await;
        let discoverer = stack.start_discoverer().await.unwrap();
        let profiler = stack.start_profiler();

        let mut session = QuerySession::open(
            Arc::new(stack.broker.connect()),
            &json!({"keywords": ["people"]}),
        )
        .await
        .unwrap();

        let mut saw_dataset = false;
        while !saw_dataset {
            let event = tokio::time::timeout(Duration::from_secs(5), session.next_event())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let QueryEvent::Dataset(profiled) = event {
                assert_eq!(profiled.id.as_str(), "datamart.example.example_nyu");
                saw_dataset = true;
            }
        }

        discoverer.shutdown().await;
        profiler.abort();
    }
}
