//! sitefetch - resilient outbound HTTP pipeline and site crawler
//!
//! One descriptor type carries a request through a stack of decorators
//! (response cache, telemetry, retry + circuit breaker) around a reqwest
//! base sender, and comes back populated with status, payload, errors,
//! and timing. A breadth-first same-origin crawler builds sitemaps on
//! top of the same pipeline.

pub mod config;
pub mod crawler;
pub mod error;
pub mod logging;
pub mod pipeline;

pub use config::{AppConfig, ConfigManager, CrawlerConfig, HttpConfig, LoggingConfig};
pub use crawler::{CrawlResult, CrawlStats, Crawler, PageRecord};
pub use error::FetchError;
pub use pipeline::{
    build_pipeline, dispatch_all, BaseSender, CacheDecorator, CircuitState, RequestDescriptor,
    RetryCircuitDecorator, SendService, StandardPipeline, TelemetryDecorator,
};
