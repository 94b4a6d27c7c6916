use serde::{Deserialize, Serialize};

use crate::error::PluginErrorKind;

/// What happens to a query message whose handler failed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureAction {
    /// Acknowledge and forget; redelivery would reproduce the failure.
    #[default]
    AckAndDrop,
    /// Return the message to the queue for another attempt.
    NackAndRequeue,
    /// Reject without requeue so the broker routes it to the queue's
    /// dead-letter exchange (or drops it when none is configured).
    DeadLetter,
}

/// Per-error-kind [`FailureAction`] selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFailurePolicy {
    pub invalid_query: FailureAction,
    pub transient: FailureAction,
    pub failed: FailureAction,
    pub panicked: FailureAction,
}

impl QueryFailurePolicy {
    pub fn uniform(action: FailureAction) -> Self {
        Self {
            invalid_query: action,
            transient: action,
            failed: action,
            panicked: action,
        }
    }

    pub fn action_for(&self, kind: PluginErrorKind) -> FailureAction {
        match kind {
            PluginErrorKind::InvalidQuery => self.invalid_query,
            PluginErrorKind::Transient => self.transient,
            PluginErrorKind::Failed => self.failed,
            PluginErrorKind::Panicked => self.panicked,
        }
    }
}
