//! Telemetry decorator
//!
//! Measures elapsed time and stamps the UTC completion timestamp on every
//! dispatch, success or failure, without altering the result otherwise.

use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pipeline::{RequestDescriptor, SendService};

/// Wraps a sender with latency and outcome attribution.
pub struct TelemetryDecorator<S> {
    inner: S,
}

impl<S> TelemetryDecorator<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: SendService> SendService for TelemetryDecorator<S> {
    async fn dispatch<T>(
        &self,
        request: RequestDescriptor<T>,
        cancel: CancellationToken,
    ) -> RequestDescriptor<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let started = Instant::now();
        let mut result = self.inner.dispatch(request, cancel).await;
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        result.completed_at = Some(Utc::now());

        if result.is_success() {
            debug!(
                "request {} {} completed in {}ms with status {}",
                result.id, result.path, result.elapsed_ms, result.status_code
            );
        } else {
            warn!(
                "request {} {} failed in {}ms with status {} ({} error entries)",
                result.id,
                result.path,
                result.elapsed_ms,
                result.status_code,
                result.errors.len()
            );
        }
        result
    }
}
