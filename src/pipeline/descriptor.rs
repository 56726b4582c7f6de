//! Request descriptor threaded through the pipeline
//!
//! One descriptor carries both what to send (method, path, headers, body,
//! retry budget, cache window) and what came back (status, payload, raw
//! body, error list, timing). Decorators enrich it in place and hand it
//! back; the caller owns it throughout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use reqwest::Method;

use crate::error::FetchError;

/// Default retry budget applied to new descriptors.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Mutable request/result carrier for a single logical call.
///
/// A descriptor is not reused for a second dispatch; only retries of the
/// same call (inside the retry decorator) reuse the instance.
#[derive(Debug, Clone)]
pub struct RequestDescriptor<T> {
    /// Process-wide sequence id, assigned at construction.
    pub id: u64,
    /// Target URL. Must be non-empty before dispatch.
    pub path: String,
    pub method: Method,
    /// Optional request body, sent verbatim.
    pub body: Option<String>,
    /// Caller-supplied headers. Keys are case-sensitive; defaults are
    /// merged in by the sender only when absent.
    pub headers: HashMap<String, String>,
    /// Extra attempts the retry decorator may spend on this call.
    pub max_retries: u32,
    /// Cache freshness window in minutes. Zero or negative disables
    /// caching for this call.
    pub cache_minutes: i64,
    /// Counter for bulk-call scenarios; not interpreted by the pipeline.
    pub iteration: u32,

    /// HTTP status of the outcome, or the synthetic status a pipeline
    /// stage assigned on failure.
    pub status_code: u16,
    /// Deserialized response payload, when decoding succeeded.
    pub payload: Option<T>,
    /// Raw response body text. Feeds cache snapshots and HTML scanning.
    pub response_body: Option<String>,
    /// Append-only error trail. Never cleared mid-flight.
    pub errors: Vec<String>,
    /// Wall-clock duration of the call as measured by telemetry.
    pub elapsed_ms: u64,
    /// UTC completion timestamp, set once per call.
    pub completed_at: Option<DateTime<Utc>>,
}

impl<T> RequestDescriptor<T> {
    /// Create a descriptor with an explicit method.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            path: path.into(),
            method,
            body: None,
            headers: HashMap::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            cache_minutes: 0,
            iteration: 0,
            status_code: 0,
            payload: None,
            response_body: None,
            errors: Vec::new(),
            elapsed_ms: 0,
            completed_at: None,
        }
    }

    /// GET descriptor for the given URL.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// POST descriptor with a body.
    pub fn post(path: impl Into<String>, body: impl Into<String>) -> Self {
        let mut descriptor = Self::new(Method::POST, path);
        descriptor.body = Some(body.into());
        descriptor
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_cache_minutes(mut self, minutes: i64) -> Self {
        self.cache_minutes = minutes;
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    /// Append an entry to the error trail.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Fold a classified failure into the descriptor: the message joins
    /// the error trail and the status code is overwritten when the
    /// failure maps to one.
    pub fn fail(&mut self, error: &FetchError) {
        self.record_error(error.to_string());
        if let Some(status) = error.status_code() {
            self.status_code = status;
        }
    }

    /// Whether the call completed with a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}
