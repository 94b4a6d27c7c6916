use std::fmt;

use datamart_model::{DatasetId, FormatOptions, OutputFormat};
use sha2::{Digest, Sha256};

use crate::{
    error::CacheError,
    storage::{MAX_PLAIN_NAME_LEN, dataset_name},
};

/// Longest format name embedded verbatim in a derived key. The digest
/// always covers the full name.
const MAX_FORMAT_LEN: usize = 24;

/// Longest key accepted. Lock and temporary files append up to 38 bytes to
/// the key, and the result must still fit a 255-byte path component. Keys
/// built from dataset ids always fit.
pub const MAX_KEY_LEN: usize = MAX_PLAIN_NAME_LEN + MAX_FORMAT_LEN + 66;

/// Name of a cache entry on disk.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Canonical CSV tier: `<dataset name>_csv`.
    pub fn canonical(id: &DatasetId) -> Result<Self, CacheError> {
        Self::new(format!("{}_{}", dataset_name(id), OutputFormat::CSV))
    }

    /// Derived tier: `<dataset name>_<format>_<sha256 of format and options>`.
    /// `options` must already be merged over the writer's defaults.
    pub fn derived(
        id: &DatasetId,
        format: &OutputFormat,
        options: &FormatOptions,
    ) -> Result<Self, CacheError> {
        let name = format.as_str();
        let shown = name.get(..MAX_FORMAT_LEN).unwrap_or(name);
        Self::new(format!(
            "{}_{shown}_{}",
            dataset_name(id),
            variant_digest(format, options)
        ))
    }

    /// Prefix shared by every entry of one dataset.
    pub fn dataset_prefix(id: &DatasetId) -> String {
        format!("{}_", dataset_name(id))
    }

    pub fn new(key: impl Into<String>) -> Result<Self, CacheError> {
        let key = key.into();
        if key.is_empty()
            || key.len() > MAX_KEY_LEN
            || key.starts_with('.')
            || key.contains(['/', '\\', '\0'])
        {
            return Err(CacheError::InvalidKey(key));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn variant_digest(format: &OutputFormat, options: &FormatOptions) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(options.canonical_json().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(full: &str) -> DatasetId {
        DatasetId::from_full(full).unwrap()
    }

    #[test]
    fn canonical_key_layout() {
        let key = CacheKey::canonical(&id("datamart.test.a_b")).unwrap();
        assert_eq!(key.as_str(), "datamart.test.a%5Fb_csv");
        assert!(key.as_str().starts_with(&CacheKey::dataset_prefix(&id("datamart.test.a_b"))));
    }

    #[test]
    fn derived_key_is_order_independent() {
        let d3m = OutputFormat::new("d3m").unwrap();
        let a = FormatOptions::new()
            .with("version", json!("4.0.0"))
            .with("x", json!({"b": 1, "a": 2}));
        let b = FormatOptions::new()
            .with("x", json!({"a": 2, "b": 1}))
            .with("version", json!("4.0.0"));
        let ds = id("datamart.test.geo");

        let key_a = CacheKey::derived(&ds, &d3m, &a).unwrap();
        assert_eq!(key_a, CacheKey::derived(&ds, &d3m, &b).unwrap());
        assert!(key_a.as_str().starts_with("datamart.test.geo_d3m_"));
        assert_eq!(key_a.as_str().len(), "datamart.test.geo_d3m_".len() + 64);

        let other = FormatOptions::new().with("version", json!("3.2.0"));
        assert_ne!(key_a, CacheKey::derived(&ds, &d3m, &other).unwrap());
    }

    #[test]
    fn rejects_unsafe_keys() {
        assert!(CacheKey::new("").is_err());
        assert!(CacheKey::new(".locks").is_err());
        assert!(CacheKey::new("a/b").is_err());
        assert!(CacheKey::new("x".repeat(MAX_KEY_LEN + 1)).is_err());
    }

    #[test]
    fn long_ids_still_produce_keys() {
        let ds = id(&format!("datamart.zenodo.{}", "a".repeat(140)));
        let long_format = OutputFormat::new("x".repeat(100)).unwrap();

        let canonical = CacheKey::canonical(&ds).unwrap();
        let derived = CacheKey::derived(&ds, &OutputFormat::d3m(), &FormatOptions::new()).unwrap();
        let odd = CacheKey::derived(&ds, &long_format, &FormatOptions::new()).unwrap();
        let prefix = CacheKey::dataset_prefix(&ds);
        for key in [&canonical, &derived, &odd] {
            assert!(key.as_str().starts_with(&prefix));
            assert!(key.as_str().len() + ".zip".len() + 33 <= 255);
        }
        assert!(odd.as_str().len() <= MAX_KEY_LEN);
        assert!(!CacheKey::dataset_prefix(&id("datamart.zenodo.a")).starts_with(&prefix));
    }
}
