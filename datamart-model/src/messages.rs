use serde::{Deserialize, Serialize};

use crate::{ids::DatasetId, metadata::DatasetMetadata};

/// Bus priority of a profiling job. On-demand discoveries jump the batch
/// backlog.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum JobPriority {
    Batch = 0,
    OnDemand = 2,
}

impl JobPriority {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Message placed on the `profile` queue for the external profiler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfilingJob {
    pub id: DatasetId,
    pub metadata: DatasetMetadata,
}

/// Progress notifications sent to a query's reply address.
///
/// Serialized as `{"work_started": "<identity>"}` / `{"work_done": ...}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkNotification {
    WorkStarted(String),
    WorkDone(String),
}

impl WorkNotification {
    pub fn identity(&self) -> &str {
        match self {
            WorkNotification::WorkStarted(identity)
            | WorkNotification::WorkDone(identity) => identity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn notifications_use_the_reply_protocol_shape() {
        let started = WorkNotification::WorkStarted("datamart.test".into());
        assert_eq!(
            serde_json::to_value(&started).unwrap(),
            json!({"work_started": "datamart.test"})
        );
        let done: WorkNotification =
            serde_json::from_value(json!({"work_done": "datamart.test"})).unwrap();
        assert_eq!(done, WorkNotification::WorkDone("datamart.test".into()));
    }

    #[test]
    fn profiling_job_wire_shape() {
        let job = ProfilingJob {
            id: DatasetId::from_full("datamart.test.geo").unwrap(),
            metadata: DatasetMetadata::new().with_name("geo"),
        };
        assert_eq!(
            serde_json::to_value(&job).unwrap(),
            json!({"id": "datamart.test.geo", "metadata": {"name": "geo"}})
        );
    }
}
