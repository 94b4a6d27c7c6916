use std::{fmt, io::Read, sync::Arc};

use chrono::Utc;
use datamart_model::{
    DatasetId, DatasetMetadata, DiscovererIdentity, JobPriority, MaterializeDescriptor,
    ProfilingJob,
};
use tokio::runtime::Handle;
use tracing::{debug, info};

use super::topology::{DATASETS_EXCHANGE, PROFILE_EXCHANGE};
use crate::{
    bus::{Message, MessageBus},
    error::{RegistrarError, StoreError},
    index::{DeletionReport, IdentityIndexBridge},
    storage::{ObjectWriter, PermanentStorage},
};

/// Turns discoveries into profiling jobs on the bus.
#[derive(Clone)]
pub struct DatasetRegistrar {
    identity: DiscovererIdentity,
    bus: Arc<dyn MessageBus>,
    storage: PermanentStorage,
}

impl fmt::Debug for DatasetRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetRegistrar")
            .field("identity", &self.identity)
            .field("bus", &self.bus)
            .field("storage", &self.storage)
            .finish()
    }
}

impl DatasetRegistrar {
    pub fn new(
        identity: DiscovererIdentity,
        bus: Arc<dyn MessageBus>,
        storage: PermanentStorage,
    ) -> Self {
        Self {
            identity,
            bus,
            storage,
        }
    }

    pub fn identity(&self) -> &DiscovererIdentity {
        &self.identity
    }

    /// Announce a dataset and queue it for profiling.
    ///
    /// The id is `<identity>.<dataset_id>`, with a random local id when none
    /// is given. When `reply_address` is set, that queue is bound to the
    /// dataset's profiling-complete events before the job is published, and
    /// the job jumps the batch backlog.
    pub async fn record_dataset(
        &self,
        materialize: MaterializeDescriptor,
        mut metadata: DatasetMetadata,
        dataset_id: Option<&str>,
        reply_address: Option<&str>,
    ) -> Result<DatasetId, RegistrarError> {
        let id = match dataset_id {
            Some(local) => self.identity.dataset_id(local)?,
            None => DatasetId::generate(&self.identity),
        };
        let local = id.local_id_in(&self.identity).unwrap_or(id.as_str());
        metadata.set_default_name(local);

        if let Some(reply) = reply_address {
            self.bus.declare_queue_passive(reply).await?;
            self.bus
                .bind_queue(reply, DATASETS_EXCHANGE, id.as_str())
                .await?;
            debug!(dataset_id = %id, reply_to = reply, "reply queue bound");
        }

        let mut descriptor = materialize;
        descriptor.stamp(&self.identity, Utc::now());
        metadata.set_materialize(descriptor);

        let priority = if reply_address.is_some() {
            JobPriority::OnDemand
        } else {
            JobPriority::Batch
        };
        let job = ProfilingJob {
            id: id.clone(),
            metadata,
        };
        self.bus
            .publish(
                PROFILE_EXCHANGE,
                "",
                Message::json(&job)?.with_priority(priority.as_u8()),
            )
            .await?;
        info!(dataset_id = %id, priority = priority.as_u8(), "Discovered");
        Ok(id)
    }

    /// Writer for the permanent copy of one of this discoverer's datasets.
    /// Record the dataset with [`MaterializeDescriptor::shared_storage`]
    /// once the writer is committed.
    pub async fn write_to_shared_storage(
        &self,
        local_id: &str,
    ) -> Result<ObjectWriter, RegistrarError> {
        let id = self.identity.dataset_id(local_id)?;
        Ok(self.storage.create(&id).await?)
    }
}

/// Handle given to plugin code. Records datasets, tagging them with the
/// reply address of the query being handled, if any.
#[derive(Clone, Debug)]
pub struct DatasetPublisher {
    registrar: DatasetRegistrar,
    bridge: Option<IdentityIndexBridge>,
    reply_to: Option<String>,
}

impl DatasetPublisher {
    pub fn new(registrar: DatasetRegistrar, bridge: Option<IdentityIndexBridge>) -> Self {
        Self {
            registrar,
            bridge,
            reply_to: None,
        }
    }

    pub(crate) fn replying_to(&self, reply_to: impl Into<String>) -> Self {
        Self {
            reply_to: Some(reply_to.into()),
            ..self.clone()
        }
    }

    pub fn identity(&self) -> &DiscovererIdentity {
        self.registrar.identity()
    }

    pub fn reply_address(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub async fn record_dataset(
        &self,
        materialize: MaterializeDescriptor,
        metadata: DatasetMetadata,
        dataset_id: Option<&str>,
    ) -> Result<DatasetId, RegistrarError> {
        self.registrar
            .record_dataset(materialize, metadata, dataset_id, self.reply_to.as_deref())
            .await
    }

    pub async fn write_to_shared_storage(
        &self,
        local_id: &str,
    ) -> Result<ObjectWriter, RegistrarError> {
        self.registrar.write_to_shared_storage(local_id).await
    }

    /// Delete one of this discoverer's datasets everywhere.
    pub async fn delete_dataset(&self, local_id: &str) -> Result<DeletionReport, RegistrarError> {
        let id = self.identity().dataset_id(local_id)?;
        self.delete_full_dataset(&id).await
    }

    pub async fn delete_full_dataset(
        &self,
        id: &DatasetId,
    ) -> Result<DeletionReport, RegistrarError> {
        let bridge = self.bridge.as_ref().ok_or(RegistrarError::NoBridge)?;
        Ok(bridge.delete_dataset(id).await?)
    }
}

/// [`DatasetPublisher`] for blocking plugin code. Only usable from threads
/// outside the async runtime, which is where blocking plugins run.
#[derive(Clone, Debug)]
pub struct BlockingPublisher {
    inner: DatasetPublisher,
    runtime: Handle,
}

impl BlockingPublisher {
    pub fn new(inner: DatasetPublisher, runtime: Handle) -> Self {
        Self { inner, runtime }
    }

    pub fn identity(&self) -> &DiscovererIdentity {
        self.inner.identity()
    }

    pub fn reply_address(&self) -> Option<&str> {
        self.inner.reply_address()
    }

    pub fn record_dataset(
        &self,
        materialize: MaterializeDescriptor,
        metadata: DatasetMetadata,
        dataset_id: Option<&str>,
    ) -> Result<DatasetId, RegistrarError> {
        self.runtime
            .block_on(self.inner.record_dataset(materialize, metadata, dataset_id))
    }

    /// Copy `contents` into permanent storage as the dataset's canonical
    /// file. Returns the number of bytes stored.
    pub fn write_to_shared_storage(
        &self,
        local_id: &str,
        mut contents: impl Read,
    ) -> Result<u64, RegistrarError> {
        self.runtime.block_on(async {
            let mut writer = self.inner.write_to_shared_storage(local_id).await?;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = contents.read(&mut buf).map_err(StoreError::Io)?;
                if n == 0 {
                    break;
                }
                writer.write_all(&buf[..n]).await?;
            }
            Ok(writer.commit().await?)
        })
    }

    pub fn delete_dataset(&self, local_id: &str) -> Result<DeletionReport, RegistrarError> {
        self.runtime.block_on(self.inner.delete_dataset(local_id))
    }

    pub fn delete_full_dataset(&self, id: &DatasetId) -> Result<DeletionReport, RegistrarError> {
        self.runtime.block_on(self.inner.delete_full_dataset(id))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;
    use crate::{
        bus::{MemoryBus, QueueOptions},
        discovery::topology::{PROFILE_QUEUE, Topology},
    };
    use tempfile::TempDir;

    async fn registrar(dir: &TempDir) -> (MemoryBus, DatasetRegistrar) {
        let bus = MemoryBus::new();
        let identity = DiscovererIdentity::new("datamart.test").unwrap();
        Topology::new(identity.clone()).declare(&bus).await.unwrap();
        let registrar = DatasetRegistrar::new(
            identity,
            Arc::new(bus.clone()),
            PermanentStorage::on_disk(dir.path()),
        );
        (bus, registrar)
    }

    fn next_job(bus: &MemoryBus) -> (u8, ProfilingJob) {
        let message = bus.broker().get(PROFILE_QUEUE).expect("job queued");
        (message.priority, message.decode().unwrap())
    }

    #[tokio::test]
    async fn namespaces_defaults_name_and_stamps() {
        let dir = TempDir::new().unwrap();
        let (bus, registrar) = registrar(&dir).await;

        let id = registrar
            .record_dataset(
                MaterializeDescriptor::direct_url("http://x/basic.csv"),
                DatasetMetadata::new().with_description("basic"),
                Some("basic"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(id.as_str(), "datamart.test.basic");

        let (priority, job) = next_job(&bus);
        assert_eq!(priority, 0);
        assert_eq!(job.id, id);
        assert_eq!(job.metadata.name(), Some("basic"));
        let materialize = job.metadata.materialize().unwrap();
        assert_eq!(materialize.identifier(), Some("datamart.test"));
        assert_eq!(materialize.url(), Some("http://x/basic.csv"));
        assert!(materialize.date().is_some_and(|d| d.ends_with('Z')));
    }

    #[tokio::test]
    async fn generated_ids_name_the_dataset_after_the_local_id() {
        let dir = TempDir::new().unwrap();
        let (bus, registrar) = registrar(&dir).await;
        let id = registrar
            .record_dataset(
                MaterializeDescriptor::shared_storage(),
                DatasetMetadata::new(),
                None,
                None,
            )
            .await
            .unwrap();
        let local = id.local_id_in(registrar.identity()).unwrap();
        let (_, job) = next_job(&bus);
        assert_eq!(job.metadata.name(), Some(local));
    }

    #[tokio::test]
    async fn reply_address_is_bound_before_the_job_and_raises_priority() {
        let dir = TempDir::new().unwrap();
        let (bus, registrar) = registrar(&dir).await;
        let reply = bus
            .declare_queue("", QueueOptions::auto_delete())
            .await
            .unwrap();

        let id = registrar
            .record_dataset(
                MaterializeDescriptor::shared_storage(),
                DatasetMetadata::new(),
                Some("geo"),
                Some(&reply),
            )
            .await
            .unwrap();

        assert!(
            bus.broker()
                .bindings(DATASETS_EXCHANGE)
                .contains(&(reply.clone(), id.to_string()))
        );
        let (priority, _) = next_job(&bus);
        assert_eq!(priority, 2);
    }

    #[tokio::test]
    async fn missing_reply_queue_fails_without_publishing() {
        let dir = TempDir::new().unwrap();
        let (bus, registrar) = registrar(&dir).await;
        let result = registrar
            .record_dataset(
                MaterializeDescriptor::shared_storage(),
                DatasetMetadata::new(),
                Some("geo"),
                Some("amq.gen-gone"),
            )
            .await;
        assert!(matches!(result, Err(RegistrarError::Bus(_))));
        assert_eq!(bus.broker().ready_count(PROFILE_QUEUE), Some(0));
    }

    #[tokio::test]
    async fn publish_failure_propagates() {
        let dir = TempDir::new().unwrap();
        let (bus, registrar) = registrar(&dir).await;
        bus.close();
        let result = registrar
            .record_dataset(
                MaterializeDescriptor::shared_storage(),
                DatasetMetadata::new(),
                Some("geo"),
                None,
            )
            .await;
        assert!(matches!(
            result,
            Err(RegistrarError::Bus(crate::error::BusError::ConnectionClosed))
        ));
    }

    #[tokio::test]
    async fn shared_storage_writes_land_under_the_full_id() {
        let dir = TempDir::new().unwrap();
        let (_bus, registrar) = registrar(&dir).await;
        let mut writer = registrar.write_to_shared_storage("geo").await.unwrap();
        writer.write_all(b"id,lat\n1,2\n").await.unwrap();
        writer.commit().await.unwrap();
        assert!(dir.path().join("datamart.test.geo/main.csv").is_file());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_publisher_bridges_into_the_runtime() {
        let dir = TempDir::new().unwrap();
        let (bus, registrar) = registrar(&dir).await;
        let publisher =
            BlockingPublisher::new(DatasetPublisher::new(registrar, None), Handle::current());

        let (id, stored, deletion) = tokio::task::spawn_blocking(move || {
            let stored = publisher
                .write_to_shared_storage("geo", &b"id\n1\n"[..])
                .unwrap();
            let id = publisher
                .record_dataset(
                    MaterializeDescriptor::shared_storage(),
                    DatasetMetadata::new().with_field("extra", json!(1)),
                    Some("geo"),
                )
                .unwrap();
            (id, stored, publisher.delete_dataset("geo"))
        })
        .await
        .unwrap();

        assert_eq!(id.as_str(), "datamart.test.geo");
        assert_eq!(stored, 5);
        assert!(matches!(deletion, Err(RegistrarError::NoBridge)));
        let (_, job) = next_job(&bus);
        assert_eq!(job.metadata.get("extra"), Some(&Value::from(1)));
    }
}
