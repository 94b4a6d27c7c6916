//! The built-in example discoverer: one small CSV kept in shared storage.

use async_trait::async_trait;
use datamart_core::{
    discovery::{BlockingBatchDiscovery, BlockingPublisher, DatasetPublisher, QueryHandler},
    error::PluginError,
};
use datamart_model::{DatasetMetadata, MaterializeDescriptor};
use serde_json::{Value, json};
use tracing::info;

pub const DATASET_ID: &str = "example_nyu";

const DATA: &str = "name,country\n\
                    Remi,France\n\
                    Heiko,Australia\n\
                    Fernando,Brazil\n\
                    Juliana,USA\n";

const KEYWORDS: &[&str] = &["example", "people", "country", "nyu"];

#[derive(Clone, Copy, Debug, Default)]
pub struct ExampleDiscoverer;

impl ExampleDiscoverer {
    fn metadata() -> DatasetMetadata {
        DatasetMetadata::new()
            .with_name("Example CSV")
            .with_field("is_example", json!(true))
    }

    fn descriptor() -> MaterializeDescriptor {
        MaterializeDescriptor::shared_storage().with_field("filename", json!("nyu.csv"))
    }

    /// Whether any query keyword names the example dataset. Keywords are a
    /// string or a list of strings.
    fn matches(query: &Value) -> Result<bool, PluginError> {
        let keywords: Vec<&str> = match query.get("keywords") {
            Some(Value::String(words)) => words.split_whitespace().collect(),
            Some(Value::Array(words)) => words.iter().filter_map(Value::as_str).collect(),
            None if query.is_object() => Vec::new(),
            _ => {
                return Err(PluginError::InvalidQuery(
                    "expected an object with string keywords".into(),
                ));
            }
        };
        Ok(keywords.iter().any(|word| {
            KEYWORDS
                .iter()
                .any(|known| word.eq_ignore_ascii_case(known))
        }))
    }
}

impl BlockingBatchDiscovery for ExampleDiscoverer {
    fn main_loop(&self, publisher: BlockingPublisher) -> Result<(), PluginError> {
        info!("Searching...");
        let size = publisher.write_to_shared_storage(DATASET_ID, DATA.as_bytes())?;
        publisher.record_dataset(
            Self::descriptor(),
            Self::metadata().with_field("size", json!(size)),
            Some(DATASET_ID),
        )?;
        Ok(())
    }
}

#[async_trait]
impl QueryHandler for ExampleDiscoverer {
    async fn handle_query(
        &self,
        query: Value,
        publisher: DatasetPublisher,
    ) -> Result<(), PluginError> {
        if !Self::matches(&query)? {
            return Ok(());
        }
        let mut writer = publisher.write_to_shared_storage(DATASET_ID).await?;
        writer
            .write_all(DATA.as_bytes())
            .await
            .map_err(|err| PluginError::Failed(err.into()))?;
        writer
            .commit()
            .await
            .map_err(|err| PluginError::Failed(err.into()))?;
        publisher
            .record_dataset(Self::descriptor(), Self::metadata(), Some(DATASET_ID))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_matching() {
        assert!(ExampleDiscoverer::matches(&json!({"keywords": "Example data"})).unwrap());
        assert!(ExampleDiscoverer::matches(&json!({"keywords": ["x", "people"]})).unwrap());
        assert!(!ExampleDiscoverer::matches(&json!({"keywords": ["weather"]})).unwrap());
        assert!(!ExampleDiscoverer::matches(&json!({})).unwrap());
        assert!(matches!(
            ExampleDiscoverer::matches(&json!("example")),
            Err(PluginError::InvalidQuery(_))
        ));
    }
}
