//! Response cache decorator
//!
//! Avoids redundant network calls for repeated reads of the same path
//! within a freshness window. The cache is best-effort: a snapshot that
//! cannot be replayed is treated as a miss, never as an error for the
//! caller.
//!
//! The key is the request path alone; method and body are ignored, so
//! two logically different calls to one path collide. That limitation is
//! preserved deliberately and flagged in the tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pipeline::sender::decode_payload;
use crate::pipeline::{RequestDescriptor, SendService};

/// Snapshot of the last successful response for one path.
struct CacheEntry {
    status_code: u16,
    body: String,
    elapsed_ms: u64,
    completed_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
}

/// Wraps a sender with a path-keyed freshness cache.
///
/// Concurrent writers race benignly: the last writer's snapshot wins,
/// which is acceptable because cache correctness is eventual.
pub struct CacheDecorator<S> {
    inner: S,
    store: Arc<RwLock<HashMap<String, CacheEntry>>>,
}

impl<S> CacheDecorator<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            store: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of snapshots currently held (expired ones linger until
    /// overwritten; expiry is lazy, on lookup).
    pub async fn snapshot_count(&self) -> usize {
        self.store.read().await.len()
    }
}

#[async_trait]
impl<S: SendService> SendService for CacheDecorator<S> {
    async fn dispatch<T>(
        &self,
        mut request: RequestDescriptor<T>,
        cancel: CancellationToken,
    ) -> RequestDescriptor<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if request.cache_minutes <= 0 {
            return self.inner.dispatch(request, cancel).await;
        }

        let now = Utc::now();
        {
            let store = self.store.read().await;
            if let Some(entry) = store.get(&request.path) {
                if entry.expires_at > now {
                    match decode_payload::<T>(&entry.body) {
                        Ok(payload) => {
                            debug!("cache hit for {} (request {})", request.path, request.id);
                            request.status_code = entry.status_code;
                            request.payload = Some(payload);
                            request.response_body = Some(entry.body.clone());
                            request.elapsed_ms = entry.elapsed_ms;
                            request.completed_at = entry.completed_at;
                            return request;
                        }
                        Err(detail) => {
                            // Unusable snapshot: log and fall through to a
                            // real fetch. Cache health never fails the call.
                            debug!(
                                "cached body for {} no longer decodes ({detail}); refetching",
                                request.path
                            );
                        }
                    }
                }
            }
        }

        let mut result = self.inner.dispatch(request, cancel).await;
        result.completed_at = Some(Utc::now());

        if result.cache_minutes > 0 && result.is_success() {
            if let Some(body) = result.response_body.clone() {
                let entry = CacheEntry {
                    status_code: result.status_code,
                    body,
                    elapsed_ms: result.elapsed_ms,
                    completed_at: result.completed_at,
                    expires_at: Utc::now() + chrono::Duration::minutes(result.cache_minutes),
                };
                self.store.write().await.insert(result.path.clone(), entry);
                debug!(
                    "cached response for {} ({} minutes)",
                    result.path, result.cache_minutes
                );
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fake transport that counts calls and serves a scripted body per call.
    struct CountingSender {
        calls: AtomicUsize,
        bodies: Vec<(u16, String)>,
    }

    impl CountingSender {
        fn new(bodies: Vec<(u16, &str)>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                bodies: bodies.into_iter().map(|(s, b)| (s, b.to_string())).collect(),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SendService for CountingSender {
        async fn dispatch<T>(
            &self,
            mut request: RequestDescriptor<T>,
            _cancel: CancellationToken,
        ) -> RequestDescriptor<T>
        where
            T: DeserializeOwned + Send + 'static,
        {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let (status, body) = self.bodies[n.min(self.bodies.len() - 1)].clone();
            request.status_code = status;
            if (200..300).contains(&status) {
                request.payload = decode_payload::<T>(&body).ok();
                request.response_body = Some(body);
            } else {
                request.record_error(format!("HTTP error status {status}"));
            }
            request
        }
    }

    #[derive(Debug, serde::Deserialize, PartialEq)]
    struct Answer {
        value: i64,
    }

    #[tokio::test]
    async fn zero_cache_minutes_passes_through() {
        let inner = CountingSender::new(vec![(200, r#"{"value":1}"#)]);
        let cache = CacheDecorator::new(inner);
        for _ in 0..3 {
            let request = RequestDescriptor::<Answer>::get("https://api.example.com/x");
            cache.dispatch(request, CancellationToken::new()).await;
        }
        assert_eq!(cache.inner.call_count(), 3);
        assert_eq!(cache.snapshot_count().await, 0);
    }

    #[tokio::test]
    async fn fresh_hit_skips_the_transport() {
        let inner = CountingSender::new(vec![(200, r#"{"value":42}"#), (200, r#"{"value":99}"#)]);
        let cache = CacheDecorator::new(inner);

        let first = cache
            .dispatch(
                RequestDescriptor::<Answer>::get("https://api.example.com/x").with_cache_minutes(1),
                CancellationToken::new(),
            )
            .await;
        let second = cache
            .dispatch(
                RequestDescriptor::<Answer>::get("https://api.example.com/x").with_cache_minutes(1),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(cache.inner.call_count(), 1, "second call must not hit the transport");
        // The cache hit masks the transport's newer value. Intentional:
        // the window has not lapsed yet.
        assert_eq!(first.payload, Some(Answer { value: 42 }));
        assert_eq!(second.payload, Some(Answer { value: 42 }));
        assert_eq!(second.completed_at, first.completed_at, "hit replays the snapshot timing");
    }

    #[tokio::test]
    async fn cache_key_ignores_body_and_method() {
        // Faithful limitation: same path, different bodies, still collides.
        let inner = CountingSender::new(vec![(200, r#"{"value":1}"#)]);
        let cache = CacheDecorator::new(inner);

        let get = RequestDescriptor::<Answer>::get("https://api.example.com/q").with_cache_minutes(5);
        let post = RequestDescriptor::<Answer>::post("https://api.example.com/q", r#"{"q":"different"}"#)
            .with_cache_minutes(5);

        let first = cache.dispatch(get, CancellationToken::new()).await;
        let second = cache.dispatch(post, CancellationToken::new()).await;

        assert_eq!(cache.inner.call_count(), 1);
        assert_eq!(first.payload, second.payload);
    }

    #[tokio::test]
    async fn lapsed_window_refetches() {
        let inner = CountingSender::new(vec![(200, r#"{"value":42}"#), (200, r#"{"value":99}"#)]);
        let cache = CacheDecorator::new(inner);

        let request =
            RequestDescriptor::<Answer>::get("https://api.example.com/x").with_cache_minutes(1);
        cache.dispatch(request, CancellationToken::new()).await;

        // Age the snapshot past its window instead of sleeping a minute.
        {
            let mut store = cache.store.write().await;
            let entry = store.get_mut("https://api.example.com/x").expect("snapshot stored");
            entry.expires_at = Utc::now() - chrono::Duration::seconds(1);
        }

        let second = cache
            .dispatch(
                RequestDescriptor::<Answer>::get("https://api.example.com/x").with_cache_minutes(1),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(cache.inner.call_count(), 2, "lapsed snapshot must refetch");
        assert_eq!(second.payload, Some(Answer { value: 99 }));
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let inner = CountingSender::new(vec![(500, ""), (200, r#"{"value":7}"#)]);
        let cache = CacheDecorator::new(inner);

        let first = cache
            .dispatch(
                RequestDescriptor::<Answer>::get("https://api.example.com/y").with_cache_minutes(1),
                CancellationToken::new(),
            )
            .await;
        assert!(!first.is_success());
        assert_eq!(cache.snapshot_count().await, 0);

        let second = cache
            .dispatch(
                RequestDescriptor::<Answer>::get("https://api.example.com/y").with_cache_minutes(1),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(second.payload, Some(Answer { value: 7 }));
        assert_eq!(cache.inner.call_count(), 2);
    }

    #[tokio::test]
    async fn undecodable_snapshot_is_a_miss() {
        // A raw-text snapshot stored by a String caller is unusable for a
        // JSON caller sharing the path; the decorator refetches.
        let inner = CountingSender::new(vec![(200, "plain text"), (200, r#"{"value":3}"#)]);
        let cache = CacheDecorator::new(inner);

        let as_text = cache
            .dispatch(
                RequestDescriptor::<String>::get("https://api.example.com/mixed").with_cache_minutes(5),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(as_text.payload.as_deref(), Some("plain text"));

        let as_json = cache
            .dispatch(
                RequestDescriptor::<Answer>::get("https://api.example.com/mixed").with_cache_minutes(5),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(as_json.payload, Some(Answer { value: 3 }));
        assert_eq!(cache.inner.call_count(), 2);
    }
}
