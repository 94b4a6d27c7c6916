//! What a discoverer plugin can do, declared once when it is started.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use super::publisher::{BlockingPublisher, DatasetPublisher};
use crate::error::PluginError;

/// Periodic or one-shot crawl of a source, cooperating with the scheduler.
#[async_trait]
pub trait BatchDiscovery: Send + Sync + 'static {
    async fn main_loop(&self, publisher: DatasetPublisher) -> Result<(), PluginError>;
}

/// Batch crawl written as plain blocking code; runs on its own thread.
pub trait BlockingBatchDiscovery: Send + Sync + 'static {
    fn main_loop(&self, publisher: BlockingPublisher) -> Result<(), PluginError>;
}

/// Handles one on-demand search query. Datasets recorded through the given
/// publisher are routed back to the query's client.
#[async_trait]
pub trait QueryHandler: Send + Sync + 'static {
    async fn handle_query(
        &self,
        query: Value,
        publisher: DatasetPublisher,
    ) -> Result<(), PluginError>;
}

/// Blocking query handler; each call occupies one worker pool slot.
pub trait BlockingQueryHandler: Send + Sync + 'static {
    fn handle_query(
        &self,
        query: Value,
        publisher: BlockingPublisher,
    ) -> Result<(), PluginError>;
}

/// How a capability is executed.
pub enum Execution<C: ?Sized, B: ?Sized> {
    Cooperative(Arc<C>),
    Blocking(Arc<B>),
}

impl<C: ?Sized, B: ?Sized> Execution<C, B> {
    pub fn is_blocking(&self) -> bool {
        matches!(self, Execution::Blocking(_))
    }
}

impl<C: ?Sized, B: ?Sized> Clone for Execution<C, B> {
    fn clone(&self) -> Self {
        match self {
            Execution::Cooperative(inner) => Execution::Cooperative(Arc::clone(inner)),
            Execution::Blocking(inner) => Execution::Blocking(Arc::clone(inner)),
        }
    }
}

impl<C: ?Sized, B: ?Sized> fmt::Debug for Execution<C, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Execution::Cooperative(_) => "Cooperative",
            Execution::Blocking(_) => "Blocking",
        })
    }
}

pub type BatchCapability = Execution<dyn BatchDiscovery, dyn BlockingBatchDiscovery>;
pub type QueryCapability = Execution<dyn QueryHandler, dyn BlockingQueryHandler>;

/// The optional hooks a discoverer provides.
#[derive(Clone, Debug, Default)]
pub struct PluginCapabilities {
    pub batch: Option<BatchCapability>,
    pub query: Option<QueryCapability>,
}

impl PluginCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch(mut self, routine: impl BatchDiscovery) -> Self {
        self.batch = Some(Execution::Cooperative(Arc::new(routine)));
        self
    }

    pub fn with_blocking_batch(mut self, routine: impl BlockingBatchDiscovery) -> Self {
        self.batch = Some(Execution::Blocking(Arc::new(routine)));
        self
    }

    pub fn with_queries(mut self, handler: impl QueryHandler) -> Self {
        self.query = Some(Execution::Cooperative(Arc::new(handler)));
        self
    }

    pub fn with_blocking_queries(mut self, handler: impl BlockingQueryHandler) -> Self {
        self.query = Some(Execution::Blocking(Arc::new(handler)));
        self
    }

    pub fn handles_queries(&self) -> bool {
        self.query.is_some()
    }
}
