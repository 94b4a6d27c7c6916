//! Conversions from the canonical CSV to other output formats.

mod d3m;

use std::{collections::HashMap, fmt, path::Path, sync::Arc};

use datamart_model::{DatasetId, DatasetMetadata, FormatOptions, OutputFormat};

use crate::error::WriterError;

pub use d3m::{D3M_DEFAULT_VERSION, D3M_VERSIONS, D3mWriter};

/// Inputs of one conversion.
#[derive(Debug)]
pub struct WriteRequest<'a> {
    pub dataset_id: &'a DatasetId,
    pub metadata: &'a DatasetMetadata,
    /// Already merged over [`FormatWriter::default_options`].
    pub options: &'a FormatOptions,
    /// The canonical CSV.
    pub source: &'a Path,
    /// Write a single file or a directory here.
    pub destination: &'a Path,
}

/// Blocking converter for one output format. Runs on the worker pool.
pub trait FormatWriter: Send + Sync + fmt::Debug + 'static {
    fn format(&self) -> OutputFormat;

    fn default_options(&self) -> FormatOptions {
        FormatOptions::new()
    }

    /// Rejects options the writer does not know. `options` are merged over
    /// the defaults.
    fn validate_options(&self, options: &FormatOptions) -> Result<(), WriterError> {
        let defaults = self.default_options();
        match options.keys().find(|key| defaults.get(key).is_none()) {
            Some(unknown) => Err(WriterError::InvalidOption(unknown.to_string())),
            None => Ok(()),
        }
    }

    fn write(&self, request: &WriteRequest<'_>) -> Result<(), WriterError>;
}

#[derive(Clone, Debug, Default)]
pub struct WriterRegistry {
    writers: HashMap<OutputFormat, Arc<dyn FormatWriter>>,
}

impl WriterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in writer.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(D3mWriter));
        registry
    }

    pub fn register(&mut self, writer: Arc<dyn FormatWriter>) {
        self.writers.insert(writer.format(), writer);
    }

    pub fn get(&self, format: &OutputFormat) -> Option<Arc<dyn FormatWriter>> {
        self.writers.get(format).cloned()
    }

    pub fn formats(&self) -> Vec<OutputFormat> {
        let mut formats: Vec<OutputFormat> = self.writers.keys().cloned().collect();
        formats.sort();
        formats
    }
}
