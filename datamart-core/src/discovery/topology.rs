//! Exchange and queue names shared by discoverers, the profiler and clients.

use tracing::debug;

use crate::{
    bus::{ExchangeKind, MessageBus, QueueOptions},
    error::BusError,
};
use datamart_model::DiscovererIdentity;

/// Fanout exchange every discoverer's query queue is bound to.
pub const QUERIES_EXCHANGE: &str = "queries";
/// Topic exchange carrying profiling-complete events, keyed by dataset id.
pub const DATASETS_EXCHANGE: &str = "datasets";
pub const PROFILE_EXCHANGE: &str = "profile";
/// Shared durable queue consumed by the profiler.
pub const PROFILE_QUEUE: &str = "profile";
pub const PROFILE_MAX_PRIORITY: u8 = 3;

pub fn query_queue_name(identity: &DiscovererIdentity) -> String {
    format!("{QUERIES_EXCHANGE}.{identity}")
}

/// What a discoverer declares on (re)connect.
#[derive(Clone, Debug)]
pub struct Topology {
    pub identity: DiscovererIdentity,
    pub handles_queries: bool,
    pub dead_letter_exchange: Option<String>,
}

impl Topology {
    pub fn new(identity: DiscovererIdentity) -> Self {
        Self {
            identity,
            handles_queries: false,
            dead_letter_exchange: None,
        }
    }

    pub fn with_queries(mut self, handles_queries: bool) -> Self {
        self.handles_queries = handles_queries;
        self
    }

    pub fn with_dead_letter_exchange(mut self, exchange: Option<String>) -> Self {
        self.dead_letter_exchange = exchange;
        self
    }

    pub fn query_queue(&self) -> String {
        query_queue_name(&self.identity)
    }

    /// Declare everything. Safe to repeat after a reconnect.
    pub async fn declare(&self, bus: &dyn MessageBus) -> Result<(), BusError> {
        bus.declare_exchange(QUERIES_EXCHANGE, ExchangeKind::Fanout)
            .await?;
        if self.handles_queries {
            let mut options = QueueOptions::auto_delete();
            if let Some(dlx) = &self.dead_letter_exchange {
                bus.declare_exchange(dlx, ExchangeKind::Fanout).await?;
                bus.declare_queue(dlx, QueueOptions::durable()).await?;
                bus.bind_queue(dlx, dlx, "").await?;
                options = options.with_dead_letter_exchange(dlx.clone());
            }
            let queue = self.query_queue();
            bus.declare_queue(&queue, options).await?;
            bus.bind_queue(&queue, QUERIES_EXCHANGE, "").await?;
        }

        bus.declare_exchange(DATASETS_EXCHANGE, ExchangeKind::Topic)
            .await?;

        bus.declare_exchange(PROFILE_EXCHANGE, ExchangeKind::Fanout)
            .await?;
        bus.declare_queue(
            PROFILE_QUEUE,
            QueueOptions::durable().with_max_priority(PROFILE_MAX_PRIORITY),
        )
        .await?;
        bus.bind_queue(PROFILE_QUEUE, PROFILE_EXCHANGE, "").await?;

        debug!(
            identity = %self.identity,
            handles_queries = self.handles_queries,
            "bus topology declared"
        );
        Ok(())
    }
}
