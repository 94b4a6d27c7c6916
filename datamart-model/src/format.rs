use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ModelError, Result};

/// Name of an output format understood by a registered writer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OutputFormat(String);

impl OutputFormat {
    pub const CSV: &'static str = "csv";
    pub const D3M: &'static str = "d3m";

    /// Lower-case ASCII letters and digits only; the name is embedded in
    /// cache keys.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.is_empty()
            || !name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
        {
            return Err(ModelError::InvalidFormat(name));
        }
        Ok(Self(name))
    }

    pub fn csv() -> Self {
        Self(Self::CSV.to_string())
    }

    pub fn d3m() -> Self {
        Self(Self::D3M.to_string())
    }

    pub fn is_csv(&self) -> bool {
        self.0 == Self::CSV
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for OutputFormat {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<OutputFormat> for String {
    fn from(value: OutputFormat) -> Self {
        value.0
    }
}

/// Writer options. Backed by an ordered map so equal option sets serialize
/// identically regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormatOptions(BTreeMap<String, Value>);

impl FormatOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// `self` layered over `defaults`; keys present in `self` win.
    pub fn merged_over(&self, defaults: &FormatOptions) -> FormatOptions {
        let mut merged = defaults.0.clone();
        merged.extend(self.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        FormatOptions(merged)
    }

    /// Sorted-key JSON rendering, nested objects included.
    pub fn canonical_json(&self) -> String {
        fn canonical(value: &Value) -> Value {
            match value {
                Value::Object(map) => {
                    let sorted: BTreeMap<&String, Value> =
                        map.iter().map(|(k, v)| (k, canonical(v))).collect();
                    Value::Object(
                        sorted
                            .into_iter()
                            .map(|(k, v)| (k.clone(), v))
                            .collect(),
                    )
                }
                Value::Array(items) => {
                    Value::Array(items.iter().map(canonical).collect())
                }
                other => other.clone(),
            }
        }

        let sorted: BTreeMap<&String, Value> =
            self.0.iter().map(|(k, v)| (k, canonical(v))).collect();
        serde_json::to_string(&sorted).unwrap_or_default()
    }
}

impl FromIterator<(String, Value)> for FormatOptions {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn format_names_are_key_safe() {
        assert!(OutputFormat::new("d3m").is_ok());
        assert!(OutputFormat::new("csv").unwrap().is_csv());
        assert!(OutputFormat::new("").is_err());
        assert!(OutputFormat::new("D3M").is_err());
        assert!(OutputFormat::new("a_b").is_err());
        assert!(OutputFormat::new("../x").is_err());
    }

    #[test]
    fn canonical_json_ignores_insertion_order() {
        let a = FormatOptions::new()
            .with("version", json!("4.0.0"))
            .with("nested", json!({"b": 1, "a": 2}));
        let b = FormatOptions::new()
            .with("nested", json!({"a": 2, "b": 1}))
            .with("version", json!("4.0.0"));
        assert_eq!(a.canonical_json(), b.canonical_json());
        assert_eq!(
            a.canonical_json(),
            r#"{"nested":{"a":2,"b":1},"version":"4.0.0"}"#
        );
    }

    #[test]
    fn explicit_options_override_defaults() {
        let defaults = FormatOptions::new().with("version", json!("4.0.0"));
        let merged = FormatOptions::new()
            .with("version", json!("3.2.0"))
            .merged_over(&defaults);
        assert_eq!(merged.get("version"), Some(&json!("3.2.0")));
        assert_eq!(
            FormatOptions::new().merged_over(&defaults),
            defaults,
            "empty request collapses onto the defaults"
        );
    }
}
