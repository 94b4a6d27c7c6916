use std::fs;

use datamart_model::{FormatOptions, OutputFormat};
use serde_json::{Map, Value, json};

use super::{FormatWriter, WriteRequest};
use crate::error::WriterError;

pub const D3M_DEFAULT_VERSION: &str = "4.0.0";
pub const D3M_VERSIONS: [&str; 2] = ["3.2.0", "4.0.0"];

const BOOLEAN: &str = "http://schema.org/Boolean";
const INTEGER: &str = "http://schema.org/Integer";
const FLOAT: &str = "http://schema.org/Float";
const DATE_TIME: &str = "http://schema.org/DateTime";
const CATEGORICAL: &str = "http://schema.org/Enumeration";

const DATA_PATH: &str = "tables/learningData.csv";
const DOC_NAME: &str = "datasetDoc.json";

/// D3M dataset directory: `datasetDoc.json` plus the data as
/// `tables/learningData.csv`.
#[derive(Clone, Copy, Debug, Default)]
pub struct D3mWriter;

fn version_of(options: &FormatOptions) -> Result<&str, WriterError> {
    match options.get("version") {
        None => Ok(D3M_DEFAULT_VERSION),
        Some(Value::String(v)) if D3M_VERSIONS.contains(&v.as_str()) => Ok(v),
        Some(other) => Err(WriterError::InvalidOption(format!(
            "unknown D3M schema version {other}"
        ))),
    }
}

fn column_type(column: &Map<String, Value>) -> &'static str {
    let semantic: Vec<&str> = column
        .get("semantic_types")
        .and_then(Value::as_array)
        .map(|types| types.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    if semantic.contains(&DATE_TIME) {
        "dateTime"
    } else if semantic.contains(&BOOLEAN) {
        "boolean"
    } else if semantic.contains(&CATEGORICAL) {
        "categorical"
    } else {
        match column.get("structural_type").and_then(Value::as_str) {
            Some(BOOLEAN) => "boolean",
            Some(INTEGER) => "integer",
            Some(FLOAT) => "real",
            _ => "string",
        }
    }
}

/// Builds the `datasetDoc.json` document.
pub(crate) fn d3m_document(
    request: &WriteRequest<'_>,
    version: &str,
    size: u64,
) -> Result<Value, WriterError> {
    let metadata = request.metadata;
    let mut columns = Vec::new();
    for (index, column) in metadata.columns().iter().enumerate() {
        let column = column.as_object().ok_or_else(|| {
            WriterError::Metadata(format!("column {index} is not an object"))
        })?;
        let name = column.get("name").and_then(Value::as_str).ok_or_else(|| {
            WriterError::Metadata(format!("column {index} has no name"))
        })?;
        let role = if name == "d3mIndex" { "index" } else { "attribute" };
        columns.push(json!({
            "colIndex": index,
            "colName": name,
            "colType": column_type(column),
            "role": [role],
        }));
    }

    let dataset_id = request.dataset_id.as_str();
    let mut about = json!({
        "datasetID": dataset_id,
        "datasetName": metadata.name().unwrap_or(dataset_id),
        "license": metadata.get("license").and_then(Value::as_str).unwrap_or("unknown"),
        "approximateSize": format!("{size} B"),
        "datasetSchemaVersion": version,
        "redacted": false,
        "datasetVersion": "1.0",
    });
    if let (Some(description), Some(about)) = (metadata.description(), about.as_object_mut()) {
        about.insert("description".into(), json!(description));
    }
    let res_format = if version == "4.0.0" {
        json!({"text/csv": ["csv"]})
    } else {
        json!(["text/csv"])
    };

    let mut doc = json!({
        "about": about,
        "dataResources": [{
            "resID": "learningData",
            "resPath": DATA_PATH,
            "resType": "table",
            "resFormat": res_format,
            "isCollection": false,
            "columns": columns,
        }],
    });
    if let (Some(qualities), Some(doc)) = (metadata.get("qualities"), doc.as_object_mut()) {
        doc.insert("qualities".into(), qualities.clone());
    }
    Ok(doc)
}

impl FormatWriter for D3mWriter {
    fn format(&self) -> OutputFormat {
        OutputFormat::d3m()
    }

    fn default_options(&self) -> FormatOptions {
        FormatOptions::new().with("version", json!(D3M_DEFAULT_VERSION))
    }

    fn validate_options(&self, options: &FormatOptions) -> Result<(), WriterError> {
        if let Some(unknown) = options.keys().find(|key| *key != "version") {
            return Err(WriterError::InvalidOption(unknown.to_string()));
        }
        version_of(options).map(|_| ())
    }

    fn write(&self, request: &WriteRequest<'_>) -> Result<(), WriterError> {
        let version = version_of(request.options)?;
        let data = request.destination.join(DATA_PATH);
        if let Some(tables) = data.parent() {
            fs::create_dir_all(tables)?;
        }
        let copied = fs::copy(request.source, &data)?;
        let size = request.metadata.size().unwrap_or(copied);

        let doc = d3m_document(request, version, size)?;
        let rendered = serde_json::to_string_pretty(&doc)
            .map_err(|err| WriterError::Metadata(err.to_string()))?;
        fs::write(request.destination.join(DOC_NAME), rendered)?;
        Ok(())
    }
}
