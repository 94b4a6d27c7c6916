use std::str::FromStr;

use crate::ConfigLoadError;

/// Parse an override value, naming the variable on failure.
pub fn parse_override<T>(var: &'static str, raw: &str) -> Result<T, ConfigLoadError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err: T::Err| ConfigLoadError::InvalidOverride {
            var,
            value: raw.to_string(),
            reason: err.to_string(),
        })
}

/// `None` for unset and blank values alike.
pub fn non_blank(raw: Option<String>) -> Option<String> {
    raw.filter(|value| !value.trim().is_empty())
}
