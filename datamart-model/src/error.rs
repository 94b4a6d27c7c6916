use std::fmt::{self, Display};

/// Errors produced by model constructors and validation routines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    InvalidIdentity(String),
    InvalidDatasetId(String),
    InvalidEncoding(String),
    InvalidFormat(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidIdentity(msg) => {
                write!(f, "invalid discoverer identity: {msg}")
            }
            ModelError::InvalidDatasetId(msg) => {
                write!(f, "invalid dataset id: {msg}")
            }
            ModelError::InvalidEncoding(msg) => {
                write!(f, "invalid encoded dataset id: {msg}")
            }
            ModelError::InvalidFormat(msg) => {
                write!(f, "invalid output format: {msg}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
