use std::{io, sync::Arc};

use datamart_model::ModelError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    #[error("Bus connection closed")]
    ConnectionClosed,

    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue {0} is exclusive to another connection")]
    ResourceLocked(String),

    #[error("Declaration of {name} conflicts with existing: {reason}")]
    PreconditionFailed { name: String, reason: String },

    #[error("Unknown delivery tag {0}")]
    UnknownDelivery(u64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure reported by (or on behalf of) a discoverer's query handler.
#[derive(Error, Debug)]
pub enum PluginError {
    /// The query itself is malformed; redelivering it cannot help.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// An upstream source hiccupped; the same query may succeed later.
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Failed(#[from] anyhow::Error),

    #[error("Handler panicked: {0}")]
    Panicked(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PluginErrorKind {
    InvalidQuery,
    Transient,
    Failed,
    Panicked,
}

impl PluginError {
    pub fn kind(&self) -> PluginErrorKind {
        match self {
            PluginError::InvalidQuery(_) => PluginErrorKind::InvalidQuery,
            PluginError::Transient(_) => PluginErrorKind::Transient,
            PluginError::Failed(_) => PluginErrorKind::Failed,
            PluginError::Panicked(_) => PluginErrorKind::Panicked,
        }
    }

    pub(crate) fn from_join(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            PluginError::Panicked(panic_message(err.into_panic()))
        } else {
            PluginError::Failed(anyhow::anyhow!("handler task cancelled"))
        }
    }
}

impl From<RegistrarError> for PluginError {
    fn from(err: RegistrarError) -> Self {
        PluginError::Failed(err.into())
    }
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker pool closed")]
    Closed,

    #[error("Worker panicked: {0}")]
    Panicked(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid object name: {0}")]
    InvalidName(String),
}

#[derive(Error, Debug)]
pub enum RegistrarError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Deletion failed: {0}")]
    Delete(#[from] BridgeError),

    #[error("No index bridge configured for deletions")]
    NoBridge,
}

/// Errors while obtaining the canonical bytes of a dataset.
///
/// Cloneable so one failed build can be reported to every waiter.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("Invalid materialization info: {0}")]
    InvalidDescriptor(String),

    #[error("No materializer available for {0}")]
    MaterializerUnavailable(String),

    #[error("Dataset exceeds the download size limit of {limit} bytes")]
    TooBig { limit: u64 },

    #[error("HTTP {status} fetching {url}")]
    Status { status: u16, url: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("IO error while fetching: {0}")]
    Io(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Http(err.to_string())
    }
}

impl From<io::Error> for FetchError {
    fn from(err: io::Error) -> Self {
        FetchError::Io(err.to_string())
    }
}

#[derive(Error, Debug, Clone)]
pub enum WriterError {
    #[error("Invalid format option {0:?}")]
    InvalidOption(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Metadata error: {0}")]
    Metadata(String),
}

impl From<io::Error> for WriterError {
    fn from(err: io::Error) -> Self {
        WriterError::Io(err.to_string())
    }
}

#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("Unknown output format: {0}")]
    UnknownFormat(String),

    #[error("Invalid format options: {0}")]
    InvalidFormatOptions(String),

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Format conversion failed: {0}")]
    Writer(#[from] WriterError),

    #[error("Permanent storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    #[error("Build task failed: {0}")]
    Task(String),
}

impl CacheError {
    /// Errors caused by the request rather than by the dataset or the host.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CacheError::UnknownFormat(_)
                | CacheError::InvalidFormatOptions(_)
                | CacheError::InvalidKey(_)
                | CacheError::Writer(WriterError::InvalidOption(_))
        )
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        CacheError::Io(Arc::new(err))
    }
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        CacheError::Storage(err.to_string())
    }
}

impl From<WorkerError> for CacheError {
    fn from(err: WorkerError) -> Self {
        CacheError::Task(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Index backend error: {0}")]
    Backend(String),

    #[error("Index backend unavailable: {0}")]
    Unavailable(String),
}

/// A deletion step that failed. Later steps are not attempted.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Removing {id} from the search index failed: {source}")]
    SearchIndex {
        id: String,
        #[source]
        source: IndexError,
    },

    #[error("Removing {id} from the similarity index failed: {source}")]
    SimilarityIndex {
        id: String,
        #[source]
        source: IndexError,
    },

    #[error("Purging cached copies of {id} failed: {source}")]
    CachePurge {
        id: String,
        #[source]
        source: CacheError,
    },

    #[error("Deleting the stored copy of {id} failed: {source}")]
    StoragePurge {
        id: String,
        #[source]
        source: StoreError,
    },
}
