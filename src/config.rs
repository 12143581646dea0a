use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Deserializer};
use typed_builder::TypedBuilder;

use crate::error::ConfigError;

/// Base URL used when `API_BASE` is not set.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
/// Per-request timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Target and transport settings shared by every request of a run.
///
/// The harness never reads ambient state on its own: a `HarnessConfig` is built
/// once and handed to the [`crate::Dispatcher`], so several runs with different
/// settings can coexist in one process. [`HarnessConfig::from_env`] is only a
/// convenience for the common "point me at `$API_BASE`" case.
#[derive(Debug, Clone, TypedBuilder, Deserialize)]
pub struct HarnessConfig {
    /// Requests with a relative path are resolved against this URL.
    #[builder(setter(into))]
    pub base_url: String,
    /// Hard limit for a single attempt, body included.
    #[builder(default = DEFAULT_TIMEOUT)]
    #[serde(default = "default_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
    /// Headers added to every request unless the request overrides them.
    #[builder(default)]
    #[serde(default)]
    pub default_headers: BTreeMap<String, String>,
    #[builder(default = default_user_agent(), setter(into))]
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_user_agent() -> String {
    concat!("rafaga/", env!("CARGO_PKG_VERSION")).to_owned()
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::builder().base_url(DEFAULT_BASE_URL).build()
    }
}

impl HarnessConfig {
    /// Build a config from `API_BASE` and `RAFAGA_TIMEOUT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("API_BASE").unwrap_or_else(|_| DEFAULT_BASE_URL.to_owned());
        let timeout = match std::env::var("RAFAGA_TIMEOUT") {
            Ok(raw) => parse_duration(&raw)?,
            Err(_) => DEFAULT_TIMEOUT,
        };
        Ok(Self::builder().base_url(base_url).timeout(timeout).build())
    }

    /// Resolve `path` against the base URL. Absolute URLs pass through untouched.
    pub fn resolve(&self, path: &str) -> Result<url::Url, ConfigError> {
        let raw = if path.starts_with("http://") || path.starts_with("https://") {
            path.to_owned()
        } else if path.is_empty() {
            self.base_url.clone()
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            )
        };
        url::Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl { url: raw, source })
    }
}

/// Parse a k6-style duration: `"500ms"`, `"15s"`, `"2m"`, `"1h"`, `"1m30s"`, `"0"`.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(input.to_owned());
    let s = input.trim();
    if s.is_empty() {
        return Err(invalid());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut nanos = 0.0_f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_end == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_end].parse().map_err(|_| invalid())?;
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit_nanos = match &rest[..unit_end] {
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        nanos += value * unit_nanos;
        rest = &rest[unit_end..];
    }
    Ok(Duration::from_nanos(nanos.round() as u64))
}

/// Accepts either a duration string or a number of milliseconds.
pub(crate) fn deserialize_duration<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    match Raw::deserialize(d)? {
        Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
        Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
    }
}
