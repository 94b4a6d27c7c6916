//! Errors surfaced while loading configuration.

use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    /// A config file named explicitly could not be read.
    #[error("failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The document was read but did not deserialize.
    #[error("{0:#}")]
    Parse(anyhow::Error),

    /// An environment override held a value of the wrong shape.
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidOverride {
        var: &'static str,
        value: String,
        reason: String,
    },

    /// The merged configuration breaks a guard rail.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
