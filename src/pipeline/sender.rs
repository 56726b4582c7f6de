//! Base sender: one descriptor in, one real network call out
//!
//! Translates a [`RequestDescriptor`] into a reqwest call, executes it
//! under the caller's cancellation token, and populates the result-side
//! fields. Every failure path returns the descriptor: this entry point
//! never throws past its boundary.

use std::any::{Any, TypeId};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, LOCATION, USER_AGENT};
use reqwest::{Client, ClientBuilder, Method, StatusCode};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::config::HttpConfig;
use crate::error::FetchError;
use crate::pipeline::{RequestDescriptor, SendService};

/// Innermost pipeline stage: builds and executes the real HTTP call.
pub struct BaseSender {
    client: Client,
    config: HttpConfig,
}

impl BaseSender {
    /// Build the shared reqwest client from configuration.
    pub fn new(config: HttpConfig) -> anyhow::Result<Self> {
        let client = ClientBuilder::new()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .cookie_store(true)
            .gzip(true)
            .redirect(if config.follow_redirects {
                reqwest::redirect::Policy::limited(10)
            } else {
                reqwest::redirect::Policy::none()
            })
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {e}"))?;

        Ok(Self { client, config })
    }

    /// Merge descriptor headers with the pipeline defaults. Caller headers
    /// win; User-Agent is only injected when absent.
    fn build_headers(&self, request_headers: &std::collections::HashMap<String, String>) -> Result<HeaderMap, FetchError> {
        let mut headers = HeaderMap::new();
        for (name, value) in request_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| FetchError::Validation(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| FetchError::Validation(format!("invalid header value for {name}: {e}")))?;
            headers.insert(name, value);
        }
        if !headers.contains_key(USER_AGENT) {
            if let Ok(value) = HeaderValue::from_str(&self.config.user_agent) {
                headers.insert(USER_AGENT, value);
            }
        }
        if !headers.contains_key(ACCEPT) {
            headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        }
        if !headers.contains_key(ACCEPT_LANGUAGE) {
            if let Ok(value) = HeaderValue::from_str(&self.config.accept_language) {
                headers.insert(ACCEPT_LANGUAGE, value);
            }
        }
        Ok(headers)
    }

    /// Persist the outbound call as an equivalent curl invocation.
    ///
    /// Debug aid only: the file is overwritten on each call and a write
    /// failure is logged and swallowed. Returns unit so a side-channel
    /// failure structurally cannot reach the caller's result.
    async fn capture_curl_command(
        &self,
        method: &Method,
        path: &str,
        body: Option<&String>,
        headers: &HeaderMap,
    ) {
        let Some(capture_path) = &self.config.curl_capture_path else {
            return;
        };
        let mut command = format!("curl -X {method} '{path}'");
        for (name, value) in headers {
            command.push_str(&format!(" -H '{}: {}'", name, value.to_str().unwrap_or("<binary>")));
        }
        if let Some(body) = body {
            command.push_str(&format!(" --data '{body}'"));
        }
        command.push('\n');
        if let Err(e) = tokio::fs::write(capture_path, command).await {
            warn!("curl capture skipped ({}): {e}", capture_path.display());
        }
    }
}

/// Classify a reqwest error into the pipeline taxonomy.
fn classify_transport_error(error: &reqwest::Error) -> FetchError {
    if error.is_timeout() {
        FetchError::Timeout(format!("request timed out: {error}"))
    } else {
        FetchError::Transport {
            message: error.to_string(),
            status: error.status().map(|s| s.as_u16()),
        }
    }
}

/// Decode a response body into the caller's expected shape.
///
/// Raw-text callers (`T = String`) get the body verbatim; everything else
/// goes through serde_json, whose bounded recursion depth stands in for
/// the bounded-nesting requirement.
pub(crate) fn decode_payload<T>(body: &str) -> Result<T, String>
where
    T: DeserializeOwned + 'static,
{
    if TypeId::of::<T>() == TypeId::of::<String>() {
        let boxed: Box<dyn Any> = Box::new(body.to_owned());
        return boxed
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| "string payload downcast failed".to_owned());
    }
    serde_json::from_str::<T>(body).map_err(|e| e.to_string())
}

#[async_trait]
impl SendService for BaseSender {
    async fn dispatch<T>(
        &self,
        mut request: RequestDescriptor<T>,
        cancel: CancellationToken,
    ) -> RequestDescriptor<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if request.path.trim().is_empty() {
            warn!("request {} rejected: empty path", request.id);
            request.fail(&FetchError::Validation("request path must not be empty".into()));
            return request;
        }
        let url = match Url::parse(&request.path) {
            Ok(url) => url,
            Err(e) => {
                request.fail(&FetchError::Validation(format!(
                    "invalid request url {:?}: {e}",
                    request.path
                )));
                return request;
            }
        };
        let headers = match self.build_headers(&request.headers) {
            Ok(headers) => headers,
            Err(error) => {
                request.fail(&error);
                return request;
            }
        };

        self.capture_curl_command(&request.method, &request.path, request.body.as_ref(), &headers)
            .await;

        let mut builder = self.client.request(request.method.clone(), url).headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        debug!("request {} {} {}", request.id, request.method, request.path);

        let response = tokio::select! {
            result = builder.send() => match result {
                Ok(response) => response,
                Err(e) => {
                    let error = classify_transport_error(&e);
                    warn!("request {} to {} failed: {error}", request.id, request.path);
                    request.fail(&error);
                    return request;
                }
            },
            _ = cancel.cancelled() => {
                request.fail(&FetchError::Timeout(
                    "cancelled before a response arrived".into(),
                ));
                return request;
            }
        };

        let status = response.status();
        request.status_code = status.as_u16();

        if status == StatusCode::PERMANENT_REDIRECT {
            // Observed only with redirect-following disabled; informational,
            // the chain does not auto-follow it.
            let destination = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("<missing Location header>");
            request.record_error(format!(
                "permanent redirect observed: {} -> {destination}; not followed",
                request.path
            ));
        }

        let body = tokio::select! {
            result = response.text() => match result {
                Ok(body) => body,
                Err(e) => {
                    request.record_error(format!("failed to read response body: {e}"));
                    return request;
                }
            },
            _ = cancel.cancelled() => {
                request.fail(&FetchError::Timeout(
                    "cancelled while reading the response body".into(),
                ));
                return request;
            }
        };

        if status.is_success() {
            match decode_payload::<T>(&body) {
                Ok(payload) => request.payload = Some(payload),
                Err(detail) => {
                    // Degraded success: status kept, payload left empty.
                    request.fail(&FetchError::Decode(detail));
                }
            }
        } else {
            request.record_error(format!(
                "HTTP error status {} from {}",
                request.status_code, request.path
            ));
        }
        request.response_body = Some(body);

        debug!(
            "request {} completed with status {}",
            request.id, request.status_code
        );
        request
    }
}
