// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod api;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod store;

// ---- Re-exports for the common entry points ----
pub use crate::api::{router, MirrorState};
pub use crate::breaker::{CircuitBreakerRegistry, CircuitState};
pub use crate::context::FetchContext;
pub use crate::error::FetchError;
pub use crate::ingest::scheduler::{DataClass, LiveDataCoordinator};
pub use crate::ingest::types::{FetchOptions, NewsItem};
pub use crate::ingest::{fetch_all_news, NewsAggregator};

use anyhow::Context;

/// The mirror router plus `/metrics`, built from the environment the way
/// the Shuttle entrypoint does.
pub fn app() -> anyhow::Result<axum::Router> {
    let config = config::AppConfig::from_env();
    let sources = ingest::config::SourceRegistry::load_default().context("loading source table")?;
    let ctx = FetchContext::server(config, sources)?;
    let router = api::router(MirrorState::new(ctx));

    match metrics::Metrics::init() {
        Ok(m) => Ok(router.merge(m.router())),
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder unavailable, /metrics disabled");
            Ok(router)
        }
    }
}
