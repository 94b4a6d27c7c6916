//! Discoverer runtime: bus topology, admission control and the plugin
//! contract.

mod client;
mod config;
mod coordinator;
mod gate;
mod plugin;
mod policy;
mod pool;
mod publisher;
mod topology;

pub use client::{ProfiledDataset, QueryEvent, QuerySession, publish_profiled};
pub use config::{Backoff, DiscoveryConfig};
pub use coordinator::{DiscovererHandle, DiscoveryCoordinator};
pub use gate::{AdmissionGate, QueryTicket};
pub use plugin::{
    BatchCapability, BatchDiscovery, BlockingBatchDiscovery, BlockingQueryHandler, Execution,
    PluginCapabilities, QueryCapability, QueryHandler,
};
pub use policy::{FailureAction, QueryFailurePolicy};
pub use pool::WorkerPool;
pub use publisher::{BlockingPublisher, DatasetPublisher, DatasetRegistrar};
pub use topology::{
    DATASETS_EXCHANGE, PROFILE_EXCHANGE, PROFILE_MAX_PRIORITY, PROFILE_QUEUE, QUERIES_EXCHANGE,
    Topology, query_queue_name,
};
