//! Outbound HTTP request pipeline
//!
//! A descriptor goes in, the same descriptor comes back populated with
//! status, payload, errors, and timing. Cross-cutting concerns are layered
//! as decorators around the base sender, composed statically at startup:
//!
//! ```text
//! CacheDecorator -> TelemetryDecorator -> RetryCircuitDecorator -> BaseSender
//! ```
//!
//! Any subset and order works; [`build_pipeline`] wires the standard full
//! stack. Every stage folds its failures into the descriptor rather than
//! returning `Err`; see the crate's error module for the taxonomy.

pub mod cache;
pub mod descriptor;
pub mod retry;
pub mod sender;
pub mod telemetry;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::HttpConfig;

pub use cache::CacheDecorator;
pub use descriptor::{RequestDescriptor, DEFAULT_MAX_RETRIES};
pub use retry::{BreakerConfig, CircuitState, RetryCircuitDecorator, RetryPolicy};
pub use sender::BaseSender;
pub use telemetry::TelemetryDecorator;

/// The single consumer contract: send this descriptor, get back the same
/// descriptor populated with status, payload, errors, and timing.
///
/// Implementations never return an error; failures are recorded on the
/// descriptor. The cancellation token is honored at every suspend point.
#[async_trait]
pub trait SendService: Send + Sync {
    async fn dispatch<T>(
        &self,
        request: RequestDescriptor<T>,
        cancel: CancellationToken,
    ) -> RequestDescriptor<T>
    where
        T: DeserializeOwned + Send + 'static;
}

/// The standard decorator stack, cache outermost.
pub type StandardPipeline =
    CacheDecorator<TelemetryDecorator<RetryCircuitDecorator<BaseSender>>>;

/// Compose the full pipeline from configuration: base sender wrapped in
/// retry/circuit-breaking, telemetry, and response caching.
///
/// Telemetry sits inside the cache layer so that cache hits replay the
/// stored timing instead of being re-stamped.
pub fn build_pipeline(config: &HttpConfig) -> anyhow::Result<StandardPipeline> {
    let base = BaseSender::new(config.clone())?;
    let retried = RetryCircuitDecorator::new(
        base,
        RetryPolicy::from_config(config),
        BreakerConfig::from_config(config),
    );
    Ok(CacheDecorator::new(TelemetryDecorator::new(retried)))
}

/// Dispatch a batch of descriptors with bounded fan-out.
///
/// At most `max_concurrent` requests are in flight at once; results come
/// back in input order. Used by bulk call sites that would otherwise
/// flood the target.
pub async fn dispatch_all<S, T>(
    service: Arc<S>,
    requests: Vec<RequestDescriptor<T>>,
    max_concurrent: usize,
    cancel: CancellationToken,
) -> Vec<RequestDescriptor<T>>
where
    S: SendService,
    T: DeserializeOwned + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let dispatches = requests.into_iter().map(|request| {
        let service = Arc::clone(&service);
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        async move {
            // The semaphore is never closed; a failed acquire just means
            // the permit is skipped rather than the request dropped.
            let _permit = semaphore.acquire_owned().await.ok();
            service.dispatch(request, cancel).await
        }
    });
    futures::future::join_all(dispatches).await
}
