//! Parsing helpers for raw environment values.

use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};

/// Trim a raw value, treating blank strings as absent.
pub(crate) fn non_blank(raw: Option<String>) -> Option<String> {
    raw.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn parse_interval_ms(
    field: &'static str,
    raw: &str,
    min: u64,
    max: u64,
) -> ConfigResult<Duration> {
    let millis = raw.parse::<u64>().map_err(|_| ConfigError::InvalidField {
        field,
        value: raw.to_string(),
        reason: "must be an unsigned integer",
    })?;
    if !(min..=max).contains(&millis) {
        return Err(ConfigError::InvalidField {
            field,
            value: raw.to_string(),
            reason: "out of range",
        });
    }
    Ok(Duration::from_millis(millis))
}

pub(crate) fn parse_capacity(field: &'static str, raw: &str) -> ConfigResult<usize> {
    let capacity = raw.parse::<usize>().map_err(|_| ConfigError::InvalidField {
        field,
        value: raw.to_string(),
        reason: "must be an unsigned integer",
    })?;
    if capacity == 0 {
        return Err(ConfigError::InvalidField {
            field,
            value: raw.to_string(),
            reason: "must be greater than zero",
        });
    }
    Ok(capacity)
}

pub(crate) fn parse_log_format(field: &'static str, raw: &str) -> ConfigResult<String> {
    let normalized = raw.to_ascii_lowercase();
    match normalized.as_str() {
        "json" | "pretty" => Ok(normalized),
        _ => Err(ConfigError::InvalidField {
            field,
            value: raw.to_string(),
            reason: "must be json or pretty",
        }),
    }
}

pub(crate) fn parse_database_url(field: &'static str, raw: &str) -> ConfigResult<String> {
    if raw.starts_with("sqlite:") {
        Ok(raw.to_string())
    } else {
        Err(ConfigError::InvalidField {
            field,
            value: raw.to_string(),
            reason: "must use the sqlite scheme",
        })
    }
}
