use datamart_model::DiscovererIdentity;

use crate::{ConfigLoadError, models::Config};

/// Reject configurations the runtime cannot honour.
pub fn validate(config: &Config) -> Result<(), ConfigLoadError> {
    DiscovererIdentity::new(config.identity.as_str())
        .map_err(|err| ConfigLoadError::Invalid(err.to_string()))?;
    if config.discovery.concurrency == 0 {
        return Err(ConfigLoadError::Invalid(
            "discovery.concurrency must be at least 1".into(),
        ));
    }
    if config.discovery.worker_threads == 0 {
        return Err(ConfigLoadError::Invalid(
            "discovery.worker_threads must be at least 1".into(),
        ));
    }
    if config.discovery.reconnect_backoff_min_ms > config.discovery.reconnect_backoff_max_ms {
        return Err(ConfigLoadError::Invalid(
            "discovery.reconnect_backoff_min_ms exceeds reconnect_backoff_max_ms".into(),
        ));
    }
    if config.cache.root == config.cache.permanent_root {
        return Err(ConfigLoadError::Invalid(
            "cache.root and cache.permanent_root must differ".into(),
        ));
    }
    Ok(())
}
