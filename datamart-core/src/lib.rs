//! Discovery runtime for Datamart.
//!
//! Discoverer plugins find datasets and register them for profiling over a
//! message bus; clients broadcast on-demand queries to every discoverer and
//! hear back as results are profiled. Materialized copies of datasets are
//! served from a two-tier on-disk cache shared by every process on the host.
#![allow(missing_docs)]

pub mod bus;
pub mod discovery;
pub mod error;
pub mod index;
pub mod materialize;
pub mod storage;

pub use bus::{MemoryBroker, MemoryBus, MessageBus};
pub use discovery::{
    AdmissionGate, BatchDiscovery, BlockingBatchDiscovery, BlockingPublisher,
    BlockingQueryHandler, DatasetPublisher, DatasetRegistrar, DiscovererHandle,
    DiscoveryConfig, DiscoveryCoordinator, PluginCapabilities, QueryHandler, QuerySession,
    WorkerPool,
};
pub use error::{
    BridgeError, BusError, CacheError, FetchError, PluginError, RegistrarError, StoreError,
};
pub use index::{DeletionReport, IdentityIndexBridge, SearchIndex, SimilarityIndex};
pub use materialize::{CacheConfig, MaterializationCache, ScopedPath};
pub use storage::PermanentStorage;
