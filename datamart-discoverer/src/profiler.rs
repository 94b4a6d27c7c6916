//! Stand-in for the profiling service: summarizes each queued dataset,
//! indexes it and announces it on the `datasets` exchange.

use std::{path::Path, sync::Arc};

use anyhow::Context;
use datamart_core::{
    bus::{ConsumeOptions, Message, MessageBus},
    discovery::{PROFILE_QUEUE, publish_profiled},
    index::{MemorySearchIndex, SearchIndex},
    materialize::MaterializationCache,
};
use datamart_model::{DatasetId, FormatOptions, OutputFormat, ProfilingJob};
use serde_json::{Value, json};
use tracing::{info, warn};

/// Header columns and data row count of a CSV file. Quoted fields
/// containing commas or newlines are not handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvSummary {
    pub columns: Vec<String>,
    pub rows: usize,
}

pub fn summarize(contents: &str) -> CsvSummary {
    let mut lines = contents.lines().filter(|line| !line.trim().is_empty());
    let columns = lines
        .next()
        .map(|header| header.split(',').map(|c| c.trim().to_string()).collect())
        .unwrap_or_default();
    CsvSummary {
        columns,
        rows: lines.count(),
    }
}

pub struct LocalProfiler {
    bus: Arc<dyn MessageBus>,
    cache: MaterializationCache,
    search: Arc<MemorySearchIndex>,
}

impl std::fmt::Debug for LocalProfiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProfiler")
            .field("bus", &self.bus)
            .field("cache_root", &self.cache.store().root())
            .finish_non_exhaustive()
    }
}

impl LocalProfiler {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        cache: MaterializationCache,
        search: Arc<MemorySearchIndex>,
    ) -> Self {
        Self { bus, cache, search }
    }

    /// Profile jobs until the consumer ends. A job that fails is logged and
    /// dropped.
    pub async fn run(self) -> anyhow::Result<()> {
        let mut consumer = self
            .bus
            .consume(PROFILE_QUEUE, ConsumeOptions::with_prefetch(1))
            .await
            .context("failed to consume profiling jobs")?;
        while let Some(delivery) = consumer.next().await {
            match self.profile(&delivery.message).await {
                Ok(id) => info!(dataset_id = %id, "Profiled"),
                Err(err) => warn!("profiling failed: {err:#}"),
            }
            delivery.ack().await?;
        }
        Ok(())
    }

    async fn profile(&self, message: &Message) -> anyhow::Result<DatasetId> {
        let job: ProfilingJob = message.decode()?;
        let csv = self
            .cache
            .get_dataset(&job.metadata, &job.id, &OutputFormat::csv(), &FormatOptions::new())
            .await
            .with_context(|| format!("failed to materialize {}", job.id))?;
        let summary = summarize(&read(csv.path()).await?);
        drop(csv);

        let mut metadata = job.metadata.into_map();
        metadata.insert(
            "columns".into(),
            Value::Array(
                summary
                    .columns
                    .iter()
                    .map(|name| json!({"name": name}))
                    .collect(),
            ),
        );
        metadata.insert("nb_rows".into(), json!(summary.rows));
        let document = Value::Object(metadata);

        self.search.upsert(&job.id, document.clone()).await?;
        publish_profiled(self.bus.as_ref(), &job.id, document).await?;
        Ok(job.id)
    }
}

async fn read(path: &Path) -> anyhow::Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}
