use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::DiscovererIdentity;

/// Free-form dataset metadata handed to the profiler.
///
/// Only a handful of keys are interpreted here (`name`, `description`,
/// `size`, `columns`, `materialize`); everything else passes through to the
/// profiler untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DatasetMetadata(Map<String, Value>);

impl DatasetMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.0.insert("name".into(), Value::String(name.into()));
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.0
            .insert("description".into(), Value::String(description.into()));
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.0.get("name").and_then(Value::as_str)
    }

    pub fn description(&self) -> Option<&str> {
        self.0.get("description").and_then(Value::as_str)
    }

    /// Size in bytes, when the profiler has already filled it in.
    pub fn size(&self) -> Option<u64> {
        self.0.get("size").and_then(Value::as_u64)
    }

    pub fn columns(&self) -> &[Value] {
        self.0
            .get("columns")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Set `name` unless the discoverer already provided one.
    pub fn set_default_name(&mut self, name: &str) {
        self.0
            .entry("name")
            .or_insert_with(|| Value::String(name.to_string()));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn materialize(&self) -> Option<MaterializeDescriptor> {
        match self.0.get("materialize") {
            Some(Value::Object(map)) => {
                Some(MaterializeDescriptor(map.clone()))
            }
            _ => None,
        }
    }

    pub fn set_materialize(&mut self, descriptor: MaterializeDescriptor) {
        self.0
            .insert("materialize".into(), Value::Object(descriptor.0));
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

/// Where a dataset's canonical bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeSource<'a> {
    /// Plain download of the canonical file.
    DirectUrl(&'a str),
    /// A named materializer understands the rest of the descriptor.
    Materializer(&'a str),
    /// Nothing to fetch; the copy lives in permanent shared storage.
    SharedStorage,
}

/// Instructions for obtaining the dataset, stamped with provenance when the
/// dataset is recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaterializeDescriptor(Map<String, Value>);

impl MaterializeDescriptor {
    /// Descriptor for a dataset written to permanent shared storage.
    pub fn shared_storage() -> Self {
        Self::default()
    }

    pub fn direct_url(url: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("direct_url".into(), Value::String(url.into()));
        Self(map)
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn url(&self) -> Option<&str> {
        self.0.get("direct_url").and_then(Value::as_str)
    }

    /// Identity of the discoverer (or materializer) that produced this entry.
    pub fn identifier(&self) -> Option<&str> {
        self.0.get("identifier").and_then(Value::as_str)
    }

    pub fn date(&self) -> Option<&str> {
        self.0.get("date").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn source(&self) -> MaterializeSource<'_> {
        if let Some(url) = self.url() {
            MaterializeSource::DirectUrl(url)
        } else if let Some(identifier) = self.identifier() {
            MaterializeSource::Materializer(identifier)
        } else {
            MaterializeSource::SharedStorage
        }
    }

    /// Record which discoverer found the dataset and when (UTC, `Z` suffix).
    pub fn stamp(&mut self, identity: &DiscovererIdentity, at: DateTime<Utc>) {
        self.0.insert(
            "identifier".into(),
            Value::String(identity.as_str().to_string()),
        );
        self.0.insert(
            "date".into(),
            Value::String(at.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn default_name_does_not_override_explicit_name() {
        let mut named = DatasetMetadata::new().with_name("daily");
        named.set_default_name("ignored");
        assert_eq!(named.name(), Some("daily"));

        let mut unnamed = DatasetMetadata::new()
            .with_description("Another simple CSV with places");
        unnamed.set_default_name("geo");
        assert_eq!(unnamed.name(), Some("geo"));
    }

    #[test]
    fn stamp_adds_identity_and_utc_date() {
        let identity = DiscovererIdentity::new("datamart.test").unwrap();
        let at = Utc.with_ymd_and_hms(2019, 6, 1, 12, 30, 0).unwrap();
        let mut descriptor = MaterializeDescriptor::direct_url("http://x/a.csv");
        descriptor.stamp(&identity, at);

        assert_eq!(descriptor.identifier(), Some("datamart.test"));
        assert_eq!(descriptor.date(), Some("2019-06-01T12:30:00.000000Z"));
        assert_eq!(descriptor.url(), Some("http://x/a.csv"));
    }

    #[test]
    fn source_prefers_direct_url() {
        let direct = MaterializeDescriptor::direct_url("http://x/a.csv")
            .with_field("identifier", json!("datamart.noaa"));
        assert_eq!(direct.source(), MaterializeSource::DirectUrl("http://x/a.csv"));

        let named = MaterializeDescriptor::from_map(
            json!({"identifier": "datamart.noaa", "noaa_id": 7})
                .as_object()
                .cloned()
                .unwrap(),
        );
        assert_eq!(named.source(), MaterializeSource::Materializer("datamart.noaa"));
        assert_eq!(
            MaterializeDescriptor::shared_storage().source(),
            MaterializeSource::SharedStorage
        );
    }

    #[test]
    fn metadata_round_trips_unknown_fields() {
        let raw = json!({
            "name": "basic",
            "is_example": true,
            "materialize": {"direct_url": "http://x/basic.csv"}
        });
        let metadata: DatasetMetadata = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(metadata.get("is_example"), Some(&json!(true)));
        assert_eq!(
            metadata.materialize().and_then(|m| m.url().map(str::to_owned)),
            Some("http://x/basic.csv".to_string())
        );
        assert_eq!(serde_json::to_value(&metadata).unwrap(), raw);
    }
}
