//! Core data model definitions shared across Datamart crates.
#![allow(missing_docs)]

pub mod error;
pub mod format;
pub mod ids;
pub mod messages;
pub mod metadata;

pub use error::{ModelError, Result as ModelResult};
pub use format::{FormatOptions, OutputFormat};
pub use ids::{
    DatasetId, DiscovererIdentity, decode_dataset_id, encode_dataset_id,
};
pub use messages::{JobPriority, ProfilingJob, WorkNotification};
pub use metadata::{DatasetMetadata, MaterializeDescriptor, MaterializeSource};
