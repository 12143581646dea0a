use thiserror::Error;

/// Errors detected while setting up a run.
///
/// These are the only fatal errors in the crate: they are raised before any
/// traffic is generated. Everything that goes wrong *during* a run (transport
/// failures, bad statuses, contract mismatches, dropped arrivals) is recorded
/// as data in the [`crate::RunReport`] instead.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("threshold references unknown metric `{0}`")]
    UnknownMetric(String),

    #[error("metric `{metric}` does not support aggregation `{aggregation}`")]
    InvalidAggregation { metric: String, aggregation: String },

    #[error("invalid threshold expression `{expression}`: {reason}")]
    InvalidThreshold { expression: String, reason: String },

    #[error("invalid load profile: {0}")]
    InvalidProfile(String),

    #[error("invalid duration `{0}`")]
    InvalidDuration(String),

    #[error("invalid url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid header `{0}`")]
    InvalidHeader(String),

    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("failed to parse options: {0}")]
    Options(#[from] serde_json::Error),
}

/// Errors raised by a [`crate::Reporter`] while writing a report somewhere.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}
