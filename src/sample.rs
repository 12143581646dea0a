use std::{collections::BTreeMap, time::Duration};

use bytes::Bytes;
use serde::Serialize;

/// A `Sample` is the outcome of a single HTTP attempt.
///
/// Samples are the smallest unit produced by the harness: the [`crate::Dispatcher`]
/// creates exactly one per attempt and never mutates it afterwards. They flow into
/// the [`crate::Aggregates`] reducer and, optionally, into a [`crate::Schema`] check.
///
/// The attempt either produced a response ([`Outcome::Response`]) or it did not
/// ([`Outcome::Failed`]), so a sample can never carry both a status and a transport
/// error. `latency` is always populated, measured from dispatch until the attempt
/// resolved one way or the other.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    pub method: String,
    pub url: String,
    #[serde(rename = "latency_ms", serialize_with = "millis::serialize")]
    pub latency: Duration,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// How an attempt resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The target answered. Any status, 5xx included, is ordinary data here.
    Response {
        status: u16,
        headers: BTreeMap<String, String>,
        #[serde(serialize_with = "lossy_text")]
        body: Bytes,
    },
    /// The attempt never produced a response: refused, reset, timed out, DNS...
    Failed { error: String },
}

impl Sample {
    pub fn response(
        method: impl Into<String>,
        url: impl Into<String>,
        latency: Duration,
        status: u16,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            latency,
            outcome: Outcome::Response {
                status,
                headers: BTreeMap::new(),
                body: body.into(),
            },
        }
    }

    pub fn failed(
        method: impl Into<String>,
        url: impl Into<String>,
        latency: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            latency,
            outcome: Outcome::Failed {
                error: error.into(),
            },
        }
    }

    /// Status code, absent when the attempt failed at the transport level.
    pub fn status(&self) -> Option<u16> {
        match &self.outcome {
            Outcome::Response { status, .. } => Some(*status),
            Outcome::Failed { .. } => None,
        }
    }

    /// Transport diagnostic, absent when a response was received.
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Response { .. } => None,
            Outcome::Failed { error } => Some(error),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        match &self.outcome {
            Outcome::Response { headers, .. } => headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str()),
            Outcome::Failed { .. } => None,
        }
    }

    /// Raw body. Empty for failed attempts.
    pub fn body(&self) -> &[u8] {
        match &self.outcome {
            Outcome::Response { body, .. } => body,
            Outcome::Failed { .. } => &[],
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.body()).into_owned()
    }

    /// Decode the body as JSON. Decoding is lazy: nothing is parsed until asked.
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(self.body())
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency.as_nanos() as f64 / 1e6
    }
}

fn lossy_text<S: serde::Serializer>(body: &Bytes, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(body))
}

/// Durations are reported as fractional milliseconds.
pub(crate) mod millis {
    use serde::{Serializer, ser::SerializeSeq};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_nanos() as f64 / 1e6)
    }

    pub fn serialize_vec<S: Serializer>(ds: &[Duration], s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(ds.len()))?;
        for d in ds {
            seq.serialize_element(&(d.as_nanos() as f64 / 1e6))?;
        }
        seq.end()
    }
}
