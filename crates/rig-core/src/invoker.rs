use crate::body::{BodyProducer, EmptyBody, RequestBody};
use crate::error::ConfigError;
use crate::sample::{MetricSample, SampleStatus};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::Body;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::debug;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub type InvokeFuture<'a> = Pin<Box<dyn Future<Output = MetricSample> + Send + 'a>>;

/// Issues one logical request against the target.
///
/// Implementations never fail: transport failures, HTTP errors and timeouts
/// are all reported as a [`MetricSample`] status. `timeout` bounds the whole
/// exchange and is owned by the run, not by the invoker.
pub trait TargetInvoker: Send + Sync {
    fn name(&self) -> &'static str;

    fn invoke(&self, timeout: Duration) -> InvokeFuture<'_>;
}

/// Response assertion counted on each sample. A failed check never changes
/// the sample status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseCheck {
    StatusIs { status: u16 },
    BodyNotEmpty,
}

impl ResponseCheck {
    /// `status` is 0 when no response arrived.
    pub fn passes(&self, status: u16, body_len: u64) -> bool {
        match self {
            ResponseCheck::StatusIs { status: expected } => status == *expected,
            ResponseCheck::BodyNotEmpty => body_len > 0,
        }
    }
}

/// How a single attempt ended, before it is turned into a sample.
#[derive(Clone, Copy)]
enum Outcome {
    Response { status: u16, body_len: u64 },
    Transport,
    Timeout,
}

fn into_sample(outcome: Outcome, latency: Duration, checks: &[ResponseCheck]) -> MetricSample {
    let (status, body_len) = match outcome {
        Outcome::Response { status, body_len } => (status, body_len),
        _ => (0, 0),
    };
    let passed = checks.iter().filter(|c| c.passes(status, body_len)).count() as u32;
    let failed = checks.len() as u32 - passed;

    let sample = match outcome {
        Outcome::Response { status, body_len } => {
            MetricSample::new(SampleStatus::from_http_status(status), latency, body_len)
                .with_http_status(status)
        }
        Outcome::Transport => MetricSample::new(SampleStatus::TransportError, latency, 0),
        Outcome::Timeout => MetricSample::new(SampleStatus::Timeout, latency, 0),
    };
    sample.with_checks(passed, failed)
}

/// Method, URL, headers, body and checks of the request every virtual user
/// repeats.
#[derive(Clone)]
pub struct RequestTemplate {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Arc<dyn BodyProducer>,
    pub checks: Vec<ResponseCheck>,
}

impl RequestTemplate {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: Arc::new(EmptyBody),
            checks: Vec::new(),
        }
    }

    /// Build a template from textual parts, e.g. as read from a scenario file.
    pub fn from_parts(
        method: &str,
        base_url: &str,
        path: &str,
        headers: &BTreeMap<String, String>,
        body: Arc<dyn BodyProducer>,
        checks: Vec<ResponseCheck>,
    ) -> Result<Self, ConfigError> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ConfigError::InvalidTarget(format!("invalid HTTP method '{method}'")))?;

        let base = Url::parse(base_url)
            .map_err(|e| ConfigError::InvalidTarget(format!("invalid base_url '{base_url}': {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidTarget(format!(
                "base_url must be http:// or https:// (got {base_url})"
            )));
        }
        let url = join_path(&base, path)
            .map_err(|e| ConfigError::InvalidTarget(format!("invalid path '{path}': {e}")))?;

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConfigError::InvalidTarget(format!("invalid header name '{name}'")))?;
            let value = HeaderValue::from_str(value).map_err(|_| {
                ConfigError::InvalidTarget(format!("invalid value for header '{name}'"))
            })?;
            header_map.insert(name, value);
        }

        Ok(Self {
            method,
            url,
            headers: header_map,
            body,
            checks,
        })
    }
}

/// Append `path` to `base`, keeping any path prefix `base` already carries.
pub fn join_path(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let prefixed = format!("{}/", base.path());
        base.set_path(&prefixed);
    }
    base.join(path.trim_start_matches('/'))
}

/// HTTP invoker backed by one shared, pooled `reqwest::Client`.
pub struct HttpInvoker {
    client: reqwest::Client,
    template: RequestTemplate,
}

impl HttpInvoker {
    pub fn new(template: RequestTemplate, pool_max_idle_per_host: usize) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build()
            .map_err(|e| ConfigError::InvalidTarget(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, template })
    }

    pub fn url(&self) -> &Url {
        &self.template.url
    }

    fn build_request(&self) -> reqwest::RequestBuilder {
        let template = &self.template;
        let request = self
            .client
            .request(template.method.clone(), template.url.clone())
            .headers(template.headers.clone());

        match template.body.produce() {
            RequestBody::Empty => request,
            RequestBody::Bytes { content_type, data } => {
                let request = match content_type {
                    Some(ct) if !template.headers.contains_key(CONTENT_TYPE) => {
                        request.header(CONTENT_TYPE, ct)
                    }
                    _ => request,
                };
                request.body(data)
            }
            RequestBody::Multipart {
                field,
                file_name,
                content_type,
                data,
            } => {
                // Content type was checked when the producer was built.
                let len = data.len() as u64;
                let part = Part::stream_with_length(Body::from(data.clone()), len)
                    .file_name(file_name.clone())
                    .mime_str(&content_type)
                    .unwrap_or_else(|_| {
                        Part::stream_with_length(Body::from(data), len).file_name(file_name)
                    });
                request.multipart(Form::new().part(field, part))
            }
        }
    }

    /// Send the request and read the full response body.
    async fn exchange(request: reqwest::RequestBuilder) -> Result<(u16, u64), reqwest::Error> {
        let mut response = request.send().await?;
        let status = response.status().as_u16();

        let mut body_len = 0u64;
        while let Some(chunk) = response.chunk().await? {
            body_len += chunk.len() as u64;
        }
        Ok((status, body_len))
    }
}

impl TargetInvoker for HttpInvoker {
    fn name(&self) -> &'static str {
        "http"
    }

    fn invoke(&self, limit: Duration) -> InvokeFuture<'_> {
        Box::pin(async move {
            let request = self.build_request();
            let start = Instant::now();
            let outcome = match timeout(limit, Self::exchange(request)).await {
                Ok(Ok((status, body_len))) => Outcome::Response { status, body_len },
                Ok(Err(e)) if e.is_timeout() => Outcome::Timeout,
                Ok(Err(e)) => {
                    debug!("Transport error on {}: {}", self.template.url, e);
                    Outcome::Transport
                }
                Err(_) => Outcome::Timeout,
            };
            into_sample(outcome, start.elapsed(), &self.template.checks)
        })
    }
}

/// What a [`MockInvoker`] does on every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Answer with `status` and a body of `body_len` bytes after the latency.
    Respond { status: u16, body_len: u64 },
    /// Fail at the transport layer after the latency.
    Refuse,
    /// Never answer; every call ends at the request timeout.
    Hang,
}

/// In-process target with fixed latency and behaviour, classified and timed
/// out exactly like [`HttpInvoker`].
pub struct MockInvoker {
    latency: Duration,
    behavior: MockBehavior,
    checks: Vec<ResponseCheck>,
}

impl MockInvoker {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            behavior: MockBehavior::Respond {
                status: 200,
                body_len: 2,
            },
            checks: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        let body_len = match self.behavior {
            MockBehavior::Respond { body_len, .. } => body_len,
            _ => 2,
        };
        self.behavior = MockBehavior::Respond { status, body_len };
        self
    }

    pub fn with_behavior(mut self, behavior: MockBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_checks(mut self, checks: Vec<ResponseCheck>) -> Self {
        self.checks = checks;
        self
    }

    async fn respond(&self) -> Outcome {
        if self.behavior == MockBehavior::Hang {
            std::future::pending::<()>().await;
        }
        sleep(self.latency).await;
        match self.behavior {
            MockBehavior::Respond { status, body_len } => Outcome::Response { status, body_len },
            _ => Outcome::Transport,
        }
    }
}

impl TargetInvoker for MockInvoker {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn invoke(&self, limit: Duration) -> InvokeFuture<'_> {
        Box::pin(async move {
            let start = Instant::now();
            let outcome = timeout(limit, self.respond())
                .await
                .unwrap_or(Outcome::Timeout);
            into_sample(outcome, start.elapsed(), &self.checks)
        })
    }
}
