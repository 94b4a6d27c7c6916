//! The querying side of the on-demand protocol, plus the profiler's
//! completion event.

use std::{fmt, sync::Arc};

use datamart_model::{DatasetId, WorkNotification};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::topology::{DATASETS_EXCHANGE, QUERIES_EXCHANGE};
use crate::{
    bus::{ConsumeOptions, Consumer, ExchangeKind, Message, MessageBus, QueueOptions},
    error::BusError,
};

/// Body of a profiling-complete event on the `datasets` exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfiledDataset {
    pub id: DatasetId,
    pub metadata: Value,
}

/// Announce that `id` has been profiled. Reaches every reply queue bound to
/// the dataset.
pub async fn publish_profiled(
    bus: &dyn MessageBus,
    id: &DatasetId,
    metadata: Value,
) -> Result<(), BusError> {
    let event = ProfiledDataset {
        id: id.clone(),
        metadata,
    };
    bus.publish(DATASETS_EXCHANGE, id.as_str(), Message::json(&event)?)
        .await
}

#[derive(Clone, Debug, PartialEq)]
pub enum QueryEvent {
    WorkStarted(String),
    WorkDone(String),
    Dataset(ProfiledDataset),
}

impl QueryEvent {
    fn decode(message: &Message) -> Result<Self, BusError> {
        if let Ok(notification) = message.decode::<WorkNotification>() {
            return Ok(match notification {
                WorkNotification::WorkStarted(identity) => QueryEvent::WorkStarted(identity),
                WorkNotification::WorkDone(identity) => QueryEvent::WorkDone(identity),
            });
        }
        Ok(QueryEvent::Dataset(message.decode()?))
    }
}

/// A query broadcast to every discoverer, with the private reply queue its
/// events arrive on.
pub struct QuerySession {
    reply_queue: String,
    consumer: Consumer,
}

impl fmt::Debug for QuerySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySession")
            .field("reply_queue", &self.reply_queue)
            .finish_non_exhaustive()
    }
}

impl QuerySession {
    /// Declare a reply queue, start listening on it, then broadcast `query`.
    /// The queue goes away when the session is dropped.
    pub async fn open(bus: Arc<dyn MessageBus>, query: &Value) -> Result<Self, BusError> {
        bus.declare_exchange(QUERIES_EXCHANGE, ExchangeKind::Fanout)
            .await?;
        bus.declare_exchange(DATASETS_EXCHANGE, ExchangeKind::Topic)
            .await?;
        let reply_queue = bus.declare_queue("", QueueOptions::auto_delete()).await?;
        let consumer = bus
            .consume(&reply_queue, ConsumeOptions::default())
            .await?;
        bus.publish(
            QUERIES_EXCHANGE,
            "",
            Message::json(query)?.with_reply_to(reply_queue.as_str()),
        )
        .await?;
        debug!(reply_queue = %reply_queue, "query published");
        Ok(Self {
            reply_queue,
            consumer,
        })
    }

    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Next event, or `None` once the reply queue is gone.
    pub async fn next_event(&mut self) -> Option<Result<QueryEvent, BusError>> {
        let delivery = self.consumer.next().await?;
        if let Err(err) = delivery.ack().await {
            warn!(reply_queue = %self.reply_queue, "failed to acknowledge event: {err}");
        }
        Some(QueryEvent::decode(&delivery.message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_decode_by_shape() {
        let started = Message::json(&json!({"work_started": "datamart.test"})).unwrap();
        assert_eq!(
            QueryEvent::decode(&started).unwrap(),
            QueryEvent::WorkStarted("datamart.test".into())
        );

        let profiled = Message::json(&json!({
            "id": "datamart.test.geo",
            "metadata": {"name": "geo"},
        }))
        .unwrap();
        let QueryEvent::Dataset(event) = QueryEvent::decode(&profiled).unwrap() else {
            panic!("expected a dataset event");
        };
        assert_eq!(event.id.as_str(), "datamart.test.geo");

        assert!(QueryEvent::decode(&Message::new("junk")).is_err());
    }
}
