//! Runs a discoverer plugin: the batch routine on its own task, and on-demand
//! queries consumed from the identity's query queue through the admission
//! gate.

use std::{fmt, panic::AssertUnwindSafe, sync::Arc};

use datamart_model::{DiscovererIdentity, WorkNotification};
use futures::FutureExt;
use serde_json::Value;
use tokio::{
    runtime::Handle,
    sync::watch,
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

use super::{
    AdmissionGate, QueryTicket, WorkerPool,
    config::{Backoff, DiscoveryConfig},
    plugin::{BatchCapability, Execution, PluginCapabilities, QueryCapability},
    policy::{FailureAction, QueryFailurePolicy},
    publisher::{BlockingPublisher, DatasetPublisher, DatasetRegistrar},
    topology::Topology,
};
use crate::{
    bus::{ConsumeOptions, Consumer, DEFAULT_EXCHANGE, Delivery, Message, MessageBus},
    error::{BusError, PluginError, WorkerError, panic_message},
    index::IdentityIndexBridge,
    storage::PermanentStorage,
};

/// Starts discoverers against a message bus.
pub struct DiscoveryCoordinator {
    identity: DiscovererIdentity,
    bus: Arc<dyn MessageBus>,
    storage: PermanentStorage,
    config: DiscoveryConfig,
    bridge: Option<IdentityIndexBridge>,
}

impl fmt::Debug for DiscoveryCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryCoordinator")
            .field("identity", &self.identity)
            .field("bus", &self.bus)
            .field("config", &self.config)
            .field("deletes", &self.bridge.is_some())
            .finish()
    }
}

impl DiscoveryCoordinator {
    pub fn new(
        identity: DiscovererIdentity,
        bus: Arc<dyn MessageBus>,
        storage: PermanentStorage,
    ) -> Self {
        Self {
            identity,
            bus,
            storage,
            config: DiscoveryConfig::default(),
            bridge: None,
        }
    }

    pub fn with_config(mut self, config: DiscoveryConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables dataset deletion from plugin code.
    pub fn with_bridge(mut self, bridge: IdentityIndexBridge) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Declare the bus topology and start the plugin's capabilities.
    ///
    /// Topology failures here are fatal; once running, lost connections are
    /// retried with backoff.
    pub async fn start(
        self,
        capabilities: PluginCapabilities,
    ) -> Result<DiscovererHandle, BusError> {
        let topology = Topology::new(self.identity.clone())
            .with_queries(capabilities.handles_queries())
            .with_dead_letter_exchange(self.config.dead_letter_exchange.clone());
        topology.declare(self.bus.as_ref()).await?;

        let registrar =
            DatasetRegistrar::new(self.identity.clone(), Arc::clone(&self.bus), self.storage);
        let publisher = DatasetPublisher::new(registrar, self.bridge);
        let gate = AdmissionGate::new(self.config.concurrency);
        let (shutdown, stopping) = watch::channel(false);

        let batch = capabilities
            .batch
            .map(|routine| tokio::spawn(run_batch(routine, publisher.clone())));

        let queries = capabilities.query.map(|handler| {
            let context = Arc::new(QueryContext {
                identity: self.identity.clone(),
                bus: Arc::clone(&self.bus),
                handler,
                pool: WorkerPool::new(self.config.worker_threads),
                publisher: publisher.clone(),
                policy: self.config.failure_policy,
            });
            let consumer = QueryLoop {
                prefetch: prefetch_for(gate.capacity()),
                context,
                topology,
                gate: gate.clone(),
                backoff: self.config.reconnect_backoff(),
                stopping,
            };
            tokio::spawn(consumer.run())
        });

        info!(
            identity = %self.identity,
            batch = batch.is_some(),
            queries = queries.is_some(),
            concurrency = gate.capacity(),
            "discoverer started"
        );
        Ok(DiscovererHandle {
            identity: self.identity,
            gate,
            publisher,
            shutdown,
            batch,
            queries,
        })
    }
}

/// Broker-side delivery window; the gate is what bounds concurrency.
fn prefetch_for(capacity: usize) -> u16 {
    u16::try_from(capacity.saturating_mul(2)).unwrap_or(u16::MAX)
}

/// A running discoverer.
#[derive(Debug)]
pub struct DiscovererHandle {
    identity: DiscovererIdentity,
    gate: AdmissionGate,
    publisher: DatasetPublisher,
    shutdown: watch::Sender<bool>,
    batch: Option<JoinHandle<()>>,
    queries: Option<JoinHandle<()>>,
}

impl DiscovererHandle {
    pub fn identity(&self) -> &DiscovererIdentity {
        &self.identity
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn publisher(&self) -> &DatasetPublisher {
        &self.publisher
    }

    /// Wait for the batch routine to return. Immediate when there is none.
    pub async fn wait_batch(&mut self) {
        if let Some(batch) = self.batch.take() {
            let _ = batch.await;
        }
    }

    /// Run until the query consumer stops, which only happens on shutdown.
    pub async fn join(mut self) {
        self.wait_batch().await;
        if let Some(queries) = self.queries.take() {
            let _ = queries.await;
        }
    }

    /// Stop taking queries and wait for those in flight to settle. A
    /// cooperative batch routine still running is cancelled.
    pub async fn shutdown(mut self) {
        info!(identity = %self.identity, "discoverer shutting down");
        let _ = self.shutdown.send(true);
        self.gate.close();
        if let Some(queries) = self.queries.take() {
            let _ = queries.await;
        }
        if let Some(batch) = self.batch.take() {
            batch.abort();
            let _ = batch.await;
        }
    }
}

async fn run_batch(routine: BatchCapability, publisher: DatasetPublisher) {
    let identity = publisher.identity().clone();
    let result = match routine {
        Execution::Cooperative(routine) => AssertUnwindSafe(routine.main_loop(publisher))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(PluginError::Panicked(panic_message(panic)))),
        Execution::Blocking(routine) => {
            let publisher = BlockingPublisher::new(publisher, Handle::current());
            tokio::task::spawn_blocking(move || routine.main_loop(publisher))
                .await
                .unwrap_or_else(|err| Err(PluginError::from_join(err)))
        }
    };
    match result {
        Ok(()) => info!(identity = %identity, "batch discovery finished"),
        Err(err) => error!(identity = %identity, "batch discovery failed: {err}"),
    }
}

/// Shared by every query handled by one discoverer.
struct QueryContext {
    identity: DiscovererIdentity,
    bus: Arc<dyn MessageBus>,
    handler: QueryCapability,
    pool: WorkerPool,
    publisher: DatasetPublisher,
    policy: QueryFailurePolicy,
}

enum Exit {
    Shutdown,
    Disconnected,
}

struct QueryLoop {
    context: Arc<QueryContext>,
    topology: Topology,
    gate: AdmissionGate,
    backoff: Backoff,
    prefetch: u16,
    stopping: watch::Receiver<bool>,
}

impl QueryLoop {
    async fn run(mut self) {
        let queue = self.topology.query_queue();
        loop {
            match self
                .context
                .bus
                .consume(&queue, ConsumeOptions::with_prefetch(self.prefetch))
                .await
            {
                Ok(consumer) => {
                    self.backoff.reset();
                    info!(queue = %queue, "consuming queries");
                    match self.consume(consumer).await {
                        Exit::Shutdown => break,
                        Exit::Disconnected => warn!(queue = %queue, "query consumer lost"),
                    }
                }
                Err(err) => warn!(queue = %queue, "cannot consume queries: {err}"),
            }

            let delay = self.backoff.next_delay();
            debug!(delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::select! {
                biased;
                _ = stopped(&mut self.stopping) => break,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(err) = self.topology.declare(self.context.bus.as_ref()).await {
                warn!("failed to redeclare topology: {err}");
            }
        }
        debug!(queue = %queue, "query consumer stopped");
    }

    /// Admit, then receive, then hand off. A ticket is always held before
    /// the next delivery is taken.
    async fn consume(&mut self, mut consumer: Consumer) -> Exit {
        let mut in_flight = JoinSet::new();
        let exit = loop {
            while in_flight.try_join_next().is_some() {}

            let ticket = tokio::select! {
                biased;
                _ = stopped(&mut self.stopping) => break Exit::Shutdown,
                ticket = self.gate.acquire() => match ticket {
                    Ok(ticket) => ticket,
                    Err(_) => break Exit::Shutdown,
                },
            };
            let delivery = tokio::select! {
                biased;
                _ = stopped(&mut self.stopping) => break Exit::Shutdown,
                delivery = consumer.next() => match delivery {
                    Some(delivery) => delivery,
                    None => break Exit::Disconnected,
                },
            };
            in_flight.spawn(handle_delivery(
                Arc::clone(&self.context),
                ticket,
                delivery,
            ));
        };
        if matches!(exit, Exit::Shutdown) {
            // Settle in-flight queries while the consumer still owns them.
            while in_flight.join_next().await.is_some() {}
        } else {
            in_flight.detach_all();
        }
        exit
    }
}

async fn stopped(stopping: &mut watch::Receiver<bool>) {
    while !*stopping.borrow_and_update() {
        if stopping.changed().await.is_err() {
            return;
        }
    }
}

async fn handle_delivery(context: Arc<QueryContext>, ticket: QueryTicket, delivery: Delivery) {
    let Some(reply_to) = delivery.reply_to().map(str::to_owned) else {
        drop(ticket);
        warn!("query has no reply address");
        settle_failure(
            &context,
            &delivery,
            PluginError::InvalidQuery("query has no reply address".into()),
        )
        .await;
        return;
    };

    let started = WorkNotification::WorkStarted(context.identity.to_string());
    if let Err(err) = notify(&context, &reply_to, &started).await {
        drop(ticket);
        warn!(reply_to = %reply_to, "could not acknowledge query, requeueing: {err}");
        if let Err(err) = delivery.reject(true).await {
            warn!("failed to requeue query: {err}");
        }
        return;
    }

    info!(reply_to = %reply_to, redelivered = delivery.redelivered, "Handling query");
    let outcome = match delivery.message.decode::<Value>() {
        Ok(query) => {
            run_handler(&context, query, context.publisher.replying_to(reply_to.as_str())).await
        }
        Err(err) => Err(PluginError::InvalidQuery(err.to_string())),
    };
    drop(ticket);

    match outcome {
        Ok(()) => {
            let done = WorkNotification::WorkDone(context.identity.to_string());
            if let Err(err) = notify(&context, &reply_to, &done).await {
                warn!(reply_to = %reply_to, "could not report completion: {err}");
            }
            if let Err(err) = delivery.ack().await {
                warn!("failed to acknowledge query: {err}");
            }
        }
        Err(err) => {
            error!(reply_to = %reply_to, "Error handling query: {err}");
            settle_failure(&context, &delivery, err).await;
        }
    }
}

async fn run_handler(
    context: &QueryContext,
    query: Value,
    publisher: DatasetPublisher,
) -> Result<(), PluginError> {
    match &context.handler {
        Execution::Cooperative(handler) => {
            let handler = Arc::clone(handler);
            tokio::spawn(async move { handler.handle_query(query, publisher).await })
                .await
                .unwrap_or_else(|err| Err(PluginError::from_join(err)))
        }
        Execution::Blocking(handler) => {
            let handler = Arc::clone(handler);
            let publisher = BlockingPublisher::new(publisher, Handle::current());
            match context
                .pool
                .run(move || handler.handle_query(query, publisher))
                .await
            {
                Ok(result) => result,
                Err(WorkerError::Panicked(message)) => Err(PluginError::Panicked(message)),
                Err(err) => Err(PluginError::Failed(err.into())),
            }
        }
    }
}

async fn notify(
    context: &QueryContext,
    reply_to: &str,
    notification: &WorkNotification,
) -> Result<(), BusError> {
    context
        .bus
        .publish(DEFAULT_EXCHANGE, reply_to, Message::json(notification)?)
        .await
}

async fn settle_failure(context: &QueryContext, delivery: &Delivery, err: PluginError) {
    let action = context.policy.action_for(err.kind());
    debug!(?action, kind = ?err.kind(), "settling failed query");
    let result = match action {
        FailureAction::AckAndDrop => delivery.ack().await,
        FailureAction::NackAndRequeue => delivery.reject(true).await,
        FailureAction::DeadLetter => delivery.reject(false).await,
    };
    if let Err(err) = result {
        warn!("failed to settle query: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefetch_scales_with_capacity() {
        assert_eq!(prefetch_for(1), 2);
        assert_eq!(prefetch_for(4), 8);
        assert_eq!(prefetch_for(usize::MAX), u16::MAX);
    }
}
