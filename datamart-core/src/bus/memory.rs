use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap},
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering},
    },
};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Acknowledger, ConsumeOptions, Consumer, DEFAULT_EXCHANGE, Delivery,
    DeliveryStream, ExchangeKind, Message, MessageBus, QueueOptions,
    topic_matches,
};
use crate::error::BusError;

/// In-process broker with AMQP routing and acknowledgement semantics.
///
/// Each [`MemoryBus`] handed out by [`connect`](Self::connect) acts as one
/// connection: exclusive queues belong to it, and interrupting it cancels its
/// consumers and requeues whatever they had not acknowledged.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    next_connection: AtomicU64,
    next_seq: AtomicU64,
    next_tag: AtomicU64,
    next_consumer: AtomicU64,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
}

struct ExchangeState {
    kind: ExchangeKind,
    /// `(queue, binding key)`
    bindings: Vec<(String, String)>,
}

struct QueueState {
    options: QueueOptions,
    owner: Option<u64>,
    ready: BinaryHeap<Pending>,
    unacked: HashMap<u64, Unacked>,
    consumers: HashMap<u64, ConsumerInfo>,
    wake: Arc<Notify>,
}

struct ConsumerInfo {
    connection: u64,
    prefetch: u16,
    in_flight: usize,
}

struct Unacked {
    consumer: u64,
    pending: Pending,
}

#[derive(Clone)]
struct Pending {
    priority: u8,
    seq: u64,
    routing_key: String,
    message: Message,
    redelivered: bool,
}

// Highest priority first, then publication order. Requeued messages keep
// their original sequence number and so return to their old position.
impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

enum Step {
    Deliver {
        message: Message,
        redelivered: bool,
        tag: u64,
    },
    Wait,
    Cancelled,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to this broker.
    pub fn connect(&self) -> MemoryBus {
        let connection =
            self.inner.next_connection.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        MemoryBus {
            broker: self.clone(),
            connection,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_seq(&self) -> u64 {
        self.inner.next_seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.lock().exchanges.get(name).map(|e| e.kind)
    }

    pub fn queue_options(&self, name: &str) -> Option<QueueOptions> {
        self.lock().queues.get(name).map(|q| q.options.clone())
    }

    /// Messages waiting to be delivered.
    pub fn ready_count(&self, name: &str) -> Option<usize> {
        self.lock().queues.get(name).map(|q| q.ready.len())
    }

    /// Messages delivered but not yet acknowledged.
    pub fn unacked_count(&self, name: &str) -> Option<usize> {
        self.lock().queues.get(name).map(|q| q.unacked.len())
    }

    pub fn consumer_count(&self, name: &str) -> Option<usize> {
        self.lock().queues.get(name).map(|q| q.consumers.len())
    }

    /// `(queue, binding key)` pairs of an exchange.
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.lock()
            .exchanges
            .get(exchange)
            .map(|e| e.bindings.clone())
            .unwrap_or_default()
    }

    /// Take the next ready message off a queue, acknowledging it at once.
    pub fn get(&self, queue: &str) -> Option<Message> {
        let mut state = self.lock();
        let queue = state.queues.get_mut(queue)?;
        queue.ready.pop().map(|pending| pending.message)
    }

    fn route(
        &self,
        state: &mut BrokerState,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<usize, BusError> {
        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let ex = state
                .exchanges
                .get(exchange)
                .ok_or_else(|| BusError::ExchangeNotFound(exchange.to_string()))?;
            let mut targets: Vec<String> = Vec::new();
            for (queue, key) in &ex.bindings {
                let matched = match ex.kind {
                    ExchangeKind::Direct => key == routing_key,
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Topic => topic_matches(key, routing_key),
                };
                if matched && !targets.contains(queue) {
                    targets.push(queue.clone());
                }
            }
            targets
        };

        let mut routed = 0;
        for name in targets {
            let seq = self.next_seq();
            if let Some(queue) = state.queues.get_mut(&name) {
                let priority = queue
                    .options
                    .max_priority
                    .map(|max| message.priority.min(max))
                    .unwrap_or(0);
                queue.ready.push(Pending {
                    priority,
                    seq,
                    routing_key: routing_key.to_string(),
                    message: message.clone(),
                    redelivered: false,
                });
                queue.wake.notify_waiters();
                routed += 1;
            }
        }
        if routed == 0 {
            debug!(exchange, routing_key, "message dropped: no matching queue");
        }
        Ok(routed)
    }

    fn poll_delivery(&self, queue: &str, consumer: u64) -> Step {
        let mut state = self.lock();
        let Some(queue) = state.queues.get_mut(queue) else {
            return Step::Cancelled;
        };
        let Some(info) = queue.consumers.get_mut(&consumer) else {
            return Step::Cancelled;
        };
        if info.prefetch > 0 && info.in_flight >= usize::from(info.prefetch) {
            return Step::Wait;
        }
        let Some(pending) = queue.ready.pop() else {
            return Step::Wait;
        };
        info.in_flight += 1;
        let tag = self.inner.next_tag.fetch_add(1, AtomicOrdering::Relaxed) + 1;
        let step = Step::Deliver {
            message: pending.message.clone(),
            redelivered: pending.redelivered,
            tag,
        };
        queue.unacked.insert(tag, Unacked { consumer, pending });
        step
    }

    fn settle(&self, queue: &str, tag: u64, outcome: Settle) -> Result<(), BusError> {
        let mut state = self.lock();
        let q = state
            .queues
            .get_mut(queue)
            .ok_or(BusError::UnknownDelivery(tag))?;
        let Unacked { consumer, mut pending } =
            q.unacked.remove(&tag).ok_or(BusError::UnknownDelivery(tag))?;
        if let Some(info) = q.consumers.get_mut(&consumer) {
            info.in_flight = info.in_flight.saturating_sub(1);
        }
        let dead_letter = match outcome {
            Settle::Ack => None,
            Settle::Requeue => {
                pending.redelivered = true;
                q.ready.push(pending);
                None
            }
            Settle::Discard => q
                .options
                .dead_letter_exchange
                .clone()
                .map(|dlx| (dlx, pending)),
        };
        q.wake.notify_waiters();

        if let Some((dlx, pending)) = dead_letter
            && let Err(err) =
                self.route(&mut state, &dlx, &pending.routing_key, &pending.message)
        {
            warn!(queue, dead_letter_exchange = %dlx, "dead-lettering failed: {err}");
        }
        Ok(())
    }

    /// Remove a consumer, requeueing its unacknowledged messages. Returns
    /// true if the queue was auto-deleted as a result.
    fn cancel_consumer(state: &mut BrokerState, queue: &str, consumer: u64) -> bool {
        let Some(q) = state.queues.get_mut(queue) else {
            return false;
        };
        if q.consumers.remove(&consumer).is_none() {
            return false;
        }
        let orphaned: Vec<u64> = q
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer == consumer)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in orphaned {
            if let Some(Unacked { mut pending, .. }) = q.unacked.remove(&tag) {
                pending.redelivered = true;
                q.ready.push(pending);
            }
        }
        q.wake.notify_waiters();

        if q.options.auto_delete && q.consumers.is_empty() {
            Self::delete_queue(state, queue);
            return true;
        }
        false
    }

    fn delete_queue(state: &mut BrokerState, queue: &str) {
        if let Some(q) = state.queues.remove(queue) {
            q.wake.notify_waiters();
            debug!(queue, dropped = q.ready.len(), "queue deleted");
        }
        for exchange in state.exchanges.values_mut() {
            exchange.bindings.retain(|(bound, _)| bound != queue);
        }
    }

    fn drop_connection(&self, connection: u64) {
        let mut state = self.lock();
        let consumers: Vec<(String, u64)> = state
            .queues
            .iter()
            .flat_map(|(name, q)| {
                q.consumers
                    .iter()
                    .filter(|(_, info)| info.connection == connection)
                    .map(|(id, _)| (name.clone(), *id))
                    .collect::<Vec<_>>()
            })
            .collect();
        for (queue, consumer) in consumers {
            Self::cancel_consumer(&mut state, &queue, consumer);
        }
        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in owned {
            Self::delete_queue(&mut state, &queue);
        }
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (exchanges, queues) = match self.inner.state.try_lock() {
            Ok(state) => (state.exchanges.len(), state.queues.len()),
            Err(_) => (0, 0),
        };
        f.debug_struct("MemoryBroker")
            .field("exchanges", &exchanges)
            .field("queues", &queues)
            .finish()
    }
}

enum Settle {
    Ack,
    Requeue,
    Discard,
}

/// One connection to a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryBus {
    broker: MemoryBroker,
    connection: u64,
    closed: Arc<AtomicBool>,
}

impl MemoryBus {
    /// A connection to a fresh private broker.
    pub fn new() -> Self {
        MemoryBroker::new().connect()
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    /// Simulate a dropped-and-restored connection: this connection's
    /// consumers end, their unacknowledged deliveries are requeued, and its
    /// exclusive queues are deleted. The connection stays usable.
    pub fn interrupt(&self) {
        self.broker.drop_connection(self.connection);
    }

    /// Close the connection for good; later operations fail.
    pub fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
        self.broker.drop_connection(self.connection);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            Err(BusError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn check_owner(&self, name: &str, queue: &QueueState) -> Result<(), BusError> {
        match queue.owner {
            Some(owner) if owner != self.connection => {
                Err(BusError::ResourceLocked(name.to_string()))
            }
            _ => Ok(()),
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBus")
            .field("connection", &self.connection)
            .field("closed", &self.is_closed())
            .field("broker", &self.broker)
            .finish()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        if name == DEFAULT_EXCHANGE {
            return Err(BusError::PreconditionFailed {
                name: name.to_string(),
                reason: "the default exchange cannot be redeclared".into(),
            });
        }
        let mut state = self.broker.lock();
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => {
                Err(BusError::PreconditionFailed {
                    name: name.to_string(),
                    reason: format!(
                        "declared as {kind:?}, exists as {:?}",
                        existing.kind
                    ),
                })
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, BusError> {
        self.ensure_open()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };
        let mut state = self.broker.lock();
        if let Some(existing) = state.queues.get(&name) {
            self.check_owner(&name, existing)?;
            if existing.options != options {
                return Err(BusError::PreconditionFailed {
                    reason: format!(
                        "declared with {options:?}, exists with {:?}",
                        existing.options
                    ),
                    name,
                });
            }
            return Ok(name);
        }
        let owner = options.exclusive.then_some(self.connection);
        state.queues.insert(
            name.clone(),
            QueueState {
                options,
                owner,
                ready: BinaryHeap::new(),
                unacked: HashMap::new(),
                consumers: HashMap::new(),
                wake: Arc::new(Notify::new()),
            },
        );
        Ok(name)
    }

    async fn declare_queue_passive(&self, name: &str) -> Result<(), BusError> {
        self.ensure_open()?;
        let state = self.broker.lock();
        let queue = state
            .queues
            .get(name)
            .ok_or_else(|| BusError::QueueNotFound(name.to_string()))?;
        self.check_owner(name, queue)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        let q = state
            .queues
            .get(queue)
            .ok_or_else(|| BusError::QueueNotFound(queue.to_string()))?;
        self.check_owner(queue, q)?;
        let ex = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| BusError::ExchangeNotFound(exchange.to_string()))?;
        let binding = (queue.to_string(), routing_key.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: Message,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        self.broker
            .route(&mut state, exchange, routing_key, &message)
            .map(|_| ())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<Consumer, BusError> {
        self.ensure_open()?;
        let consumer = self
            .broker
            .inner
            .next_consumer
            .fetch_add(1, AtomicOrdering::Relaxed)
            + 1;
        let wake = {
            let mut state = self.broker.lock();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BusError::QueueNotFound(queue.to_string()))?;
            self.check_owner(queue, q)?;
            q.consumers.insert(
                consumer,
                ConsumerInfo {
                    connection: self.connection,
                    prefetch: options.prefetch,
                    in_flight: 0,
                },
            );
            Arc::clone(&q.wake)
        };
        debug!(queue, consumer, prefetch = options.prefetch, "consumer started");
        Ok(Consumer::new(
            queue,
            Box::new(MemoryDeliveryStream {
                broker: self.broker.clone(),
                queue: queue.to_string(),
                consumer,
                wake,
            }),
        ))
    }
}

struct MemoryDeliveryStream {
    broker: MemoryBroker,
    queue: String,
    consumer: u64,
    wake: Arc<Notify>,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            let wake = Arc::clone(&self.wake);
            let notified = wake.notified();
            tokio::pin!(notified);
            // Register before looking so a publish in between is not missed.
            notified.as_mut().enable();

            match self.broker.poll_delivery(&self.queue, self.consumer) {
                Step::Deliver {
                    message,
                    redelivered,
                    tag,
                } => {
                    let acker = MemoryAcknowledger {
                        broker: self.broker.clone(),
                        queue: self.queue.clone(),
                        tag,
                    };
                    return Some(Delivery::new(
                        message,
                        redelivered,
                        tag,
                        Box::new(acker),
                    ));
                }
                Step::Cancelled => return None,
                Step::Wait => notified.await,
            }
        }
    }
}

impl Drop for MemoryDeliveryStream {
    fn drop(&mut self) {
        let mut state = self.broker.lock();
        MemoryBroker::cancel_consumer(&mut state, &self.queue, self.consumer);
    }
}

struct MemoryAcknowledger {
    broker: MemoryBroker,
    queue: String,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(&self) -> Result<(), BusError> {
        self.broker.settle(&self.queue, self.tag, Settle::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BusError> {
        let outcome = if requeue {
            Settle::Requeue
        } else {
            Settle::Discard
        };
        self.broker.settle(&self.queue, self.tag, outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn next_body(consumer: &mut Consumer) -> (String, Delivery) {
        let delivery = tokio::time::timeout(Duration::from_secs(5), consumer.next())
            .await
            .expect("delivery timed out")
            .expect("consumer ended");
        (
            String::from_utf8(delivery.message.body.clone()).unwrap(),
            delivery,
        )
    }

    #[tokio::test]
    async fn fanout_copies_to_every_bound_queue() {
        let bus = MemoryBus::new();
        bus.declare_exchange("queries", ExchangeKind::Fanout)
            .await
            .unwrap();
        for name in ["queries.a", "queries.b"] {
            bus.declare_queue(name, QueueOptions::auto_delete())
                .await
                .unwrap();
            bus.bind_queue(name, "queries", "").await.unwrap();
        }
        bus.publish("queries", "", Message::new("q")).await.unwrap();

        assert_eq!(bus.broker().ready_count("queries.a"), Some(1));
        assert_eq!(bus.broker().ready_count("queries.b"), Some(1));
    }

    #[tokio::test]
    async fn topic_exchange_routes_by_binding_key() {
        let bus = MemoryBus::new();
        bus.declare_exchange("datasets", ExchangeKind::Topic)
            .await
            .unwrap();
        let reply = bus
            .declare_queue("", QueueOptions::auto_delete())
            .await
            .unwrap();
        assert!(reply.starts_with("amq.gen-"));
        bus.bind_queue(&reply, "datasets", "datamart.test.geo")
            .await
            .unwrap();

        bus.publish("datasets", "datamart.test.geo", Message::new("hit"))
            .await
            .unwrap();
        bus.publish("datasets", "datamart.test.other", Message::new("miss"))
            .await
            .unwrap();

        assert_eq!(bus.broker().get(&reply).map(|m| m.body), Some(b"hit".to_vec()));
        assert!(bus.broker().get(&reply).is_none());
    }

    #[tokio::test]
    async fn priority_queue_serves_high_priority_first_and_fifo_within() {
        let bus = MemoryBus::new();
        bus.declare_queue("profile", QueueOptions::durable().with_max_priority(3))
            .await
            .unwrap();
        for (body, priority) in [("b1", 0), ("o1", 2), ("b2", 0), ("o2", 2), ("x", 9)] {
            bus.publish(
                DEFAULT_EXCHANGE,
                "profile",
                Message::new(body).with_priority(priority),
            )
            .await
            .unwrap();
        }
        let order: Vec<Vec<u8>> =
            std::iter::from_fn(|| bus.broker().get("profile").map(|m| m.body)).collect();
        // Priorities above the maximum are clamped to it.
        assert_eq!(
            order,
            vec![b"x".to_vec(), b"o1".to_vec(), b"o2".to_vec(), b"b1".to_vec(), b"b2".to_vec()]
        );
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries() {
        let bus = MemoryBus::new();
        bus.declare_queue("work", QueueOptions::default()).await.unwrap();
        for body in ["1", "2"] {
            bus.publish(DEFAULT_EXCHANGE, "work", Message::new(body))
                .await
                .unwrap();
        }
        let mut consumer = bus
            .consume("work", ConsumeOptions::with_prefetch(1))
            .await
            .unwrap();

        let (first, delivery) = next_body(&mut consumer).await;
        assert_eq!(first, "1");
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), consumer.next()).await;
        assert!(blocked.is_err(), "second delivery must wait for the ack");

        delivery.ack().await.unwrap();
        let (second, delivery) = next_body(&mut consumer).await;
        assert_eq!(second, "2");
        delivery.ack().await.unwrap();
        assert!(delivery.ack().await.is_err(), "double ack is rejected");
    }

    #[tokio::test]
    async fn rejected_messages_requeue_or_dead_letter() {
        let bus = MemoryBus::new();
        bus.declare_exchange("dead", ExchangeKind::Fanout).await.unwrap();
        bus.declare_queue("dead", QueueOptions::durable()).await.unwrap();
        bus.bind_queue("dead", "dead", "").await.unwrap();
        bus.declare_queue(
            "work",
            QueueOptions::default().with_dead_letter_exchange("dead"),
        )
        .await
        .unwrap();
        bus.publish(DEFAULT_EXCHANGE, "work", Message::new("m"))
            .await
            .unwrap();

        let mut consumer = bus.consume("work", ConsumeOptions::default()).await.unwrap();
        let (_, delivery) = next_body(&mut consumer).await;
        assert!(!delivery.redelivered);
        delivery.reject(true).await.unwrap();

        let (_, delivery) = next_body(&mut consumer).await;
        assert!(delivery.redelivered);
        delivery.reject(false).await.unwrap();

        assert_eq!(bus.broker().ready_count("work"), Some(0));
        assert_eq!(bus.broker().get("dead").map(|m| m.body), Some(b"m".to_vec()));
    }

    #[tokio::test]
    async fn interrupt_requeues_unacked_and_ends_consumers() {
        let broker = MemoryBroker::new();
        let bus = broker.connect();
        bus.declare_queue("work", QueueOptions::durable()).await.unwrap();
        bus.publish(DEFAULT_EXCHANGE, "work", Message::new("m"))
            .await
            .unwrap();
        let mut consumer = bus.consume("work", ConsumeOptions::default()).await.unwrap();
        let (_, delivery) = next_body(&mut consumer).await;

        bus.interrupt();
        assert!(consumer.next().await.is_none());
        assert!(delivery.ack().await.is_err(), "ack after connection loss");
        assert_eq!(broker.ready_count("work"), Some(1));

        let mut again = bus.consume("work", ConsumeOptions::default()).await.unwrap();
        let (_, delivery) = next_body(&mut again).await;
        assert!(delivery.redelivered);
    }

    #[tokio::test]
    async fn auto_delete_queue_goes_with_last_consumer() {
        let bus = MemoryBus::new();
        bus.declare_exchange("queries", ExchangeKind::Fanout)
            .await
            .unwrap();
        bus.declare_queue("queries.a", QueueOptions::auto_delete())
            .await
            .unwrap();
        bus.bind_queue("queries.a", "queries", "").await.unwrap();
        let consumer = bus
            .consume("queries.a", ConsumeOptions::default())
            .await
            .unwrap();
        drop(consumer);

        assert!(!bus.broker().has_queue("queries.a"));
        assert!(bus.broker().bindings("queries").is_empty());
    }

    #[tokio::test]
    async fn exclusive_queues_belong_to_their_connection() {
        let broker = MemoryBroker::new();
        let owner = broker.connect();
        let other = broker.connect();
        let name = owner
            .declare_queue("", QueueOptions::auto_delete().exclusive())
            .await
            .unwrap();

        assert!(matches!(
            other.declare_queue_passive(&name).await,
            Err(BusError::ResourceLocked(_))
        ));
        owner.close();
        assert!(!broker.has_queue(&name));
        assert!(matches!(
            owner.declare_queue_passive(&name).await,
            Err(BusError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn redeclaring_with_other_options_fails() {
        let bus = MemoryBus::new();
        bus.declare_queue("profile", QueueOptions::durable().with_max_priority(3))
            .await
            .unwrap();
        assert!(
            bus.declare_queue("profile", QueueOptions::durable().with_max_priority(3))
                .await
                .is_ok()
        );
        assert!(matches!(
            bus.declare_queue("profile", QueueOptions::durable()).await,
            Err(BusError::PreconditionFailed { .. })
        ));
        bus.declare_exchange("x", ExchangeKind::Topic).await.unwrap();
        assert!(bus.declare_exchange("x", ExchangeKind::Fanout).await.is_err());
        assert!(matches!(
            bus.declare_queue_passive("missing").await,
            Err(BusError::QueueNotFound(_))
        ));
    }
}
