//! Request dispatcher: one attempt in, one [`Sample`] out.
//!
//! The dispatcher is the only place where the harness touches the network. It
//! turns every transport problem (refused connection, reset, DNS failure, timeout,
//! truncated body) into a [`Sample`] whose outcome is [`Outcome::Failed`], so
//! callers can treat "the request never completed" as plain data and a single bad
//! attempt can never tear down a batch of concurrent ones.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use reqwest::{
    Client,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use tokio::time::Instant;
use typed_builder::TypedBuilder;

pub use reqwest::Method;

use crate::{
    config::HarnessConfig,
    error::ConfigError,
    sample::{Outcome, Sample},
};

/// Payload attached to a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Serialized with `Content-Type: application/json`.
    Json(serde_json::Value),
    /// Sent verbatim, no content type is added.
    Text(String),
}

/// Description of a single HTTP exchange.
///
/// `path` may be relative (resolved against [`HarnessConfig::base_url`]) or an
/// absolute URL.
#[derive(Debug, Clone, PartialEq, TypedBuilder)]
pub struct Request {
    #[builder(default = Method::GET)]
    pub method: Method,
    #[builder(setter(into))]
    pub path: String,
    #[builder(default)]
    pub headers: BTreeMap<String, String>,
    #[builder(default, setter(strip_option))]
    pub body: Option<Body>,
    /// Overrides [`HarnessConfig::timeout`] for this request only.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn get(path: impl Into<String>) -> Self {
        Self::builder().path(path).build()
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::builder().method(Method::DELETE).path(path).build()
    }

    pub fn post_json(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::with_json(Method::POST, path, body)
    }

    pub fn put_json(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::with_json(Method::PUT, path, body)
    }

    pub fn patch_json(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::with_json(Method::PATCH, path, body)
    }

    fn with_json(method: Method, path: impl Into<String>, body: serde_json::Value) -> Self {
        Self::builder()
            .method(method)
            .path(path)
            .body(Body::Json(body))
            .build()
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Performs HTTP exchanges and records them as [`Sample`]s.
///
/// Cloning is cheap: the underlying connection pool and configuration are shared.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: Client,
    config: Arc<HarnessConfig>,
}

impl Dispatcher {
    /// Build a dispatcher. Fails only on bad configuration (base URL, headers),
    /// never because the target is unreachable.
    pub fn new(config: HarnessConfig) -> Result<Self, ConfigError> {
        config.resolve("")?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConfigError::InvalidHeader(name.clone()))?;
            let value =
                HeaderValue::from_str(value).map_err(|_| ConfigError::InvalidHeader(value.clone()))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Perform exactly one network call and report how it went.
    ///
    /// This never fails: the whole exchange, body included, is bounded by the
    /// request timeout and anything that goes wrong is folded into the sample.
    pub async fn dispatch(&self, request: &Request) -> Sample {
        let start = Instant::now();
        let method = request.method.as_str().to_owned();

        let url = match self.config.resolve(&request.path) {
            Ok(url) => url,
            Err(e) => return Sample::failed(method, request.path.clone(), start.elapsed(), e.to_string()),
        };
        let timeout = request.timeout.unwrap_or(self.config.timeout);

        let mut builder = self.client.request(request.method.clone(), url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            Some(Body::Json(value)) => builder.json(value),
            Some(Body::Text(text)) => builder.body(text.clone()),
            None => builder,
        };

        let exchange = async {
            let response = builder.send().await?;
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .map(|(k, v)| (k.as_str().to_owned(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
                .collect::<BTreeMap<_, _>>();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, headers, body))
        };

        let outcome = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok((status, headers, body))) => Outcome::Response {
                status,
                headers,
                body,
            },
            Ok(Err(e)) => Outcome::Failed {
                error: describe(&e),
            },
            Err(_) => Outcome::Failed {
                error: format!("timeout after {}ms", timeout.as_millis()),
            },
        };

        let latency = start.elapsed();
        if let Outcome::Failed { error } = &outcome {
            tracing::debug!("{method} {url} failed after {latency:?}: {error}");
        }

        Sample {
            method,
            url: url.to_string(),
            latency,
            outcome,
        }
    }
}

/// Short diagnostic for a transport failure.
fn describe(e: &reqwest::Error) -> String {
    let kind = if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection failed"
    } else if e.is_body() || e.is_decode() {
        "malformed response"
    } else if e.is_request() {
        "request error"
    } else {
        "transport error"
    };

    match std::error::Error::source(e) {
        Some(source) => format!("{kind}: {source}"),
        None => kind.to_owned(),
    }
}
