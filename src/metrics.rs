// src/metrics.rs
use anyhow::Context;
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::cache::{MARKET_TTL, NEWS_TTL};

pub struct Metrics {
    pub handle: PrometheusHandle,
}

/// Mirror and coordinator series; ingest describes its own.
pub fn describe_series() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("mirror_cache_hits_total", "Mirror responses served from cache.");
        describe_counter!("mirror_cache_misses_total", "Mirror responses that went upstream.");
        describe_counter!("coordinator_runs_total", "Data class refreshes started.");
        describe_counter!("coordinator_errors_total", "Data class refreshes that failed.");
        describe_gauge!("mirror_news_cache_ttl_ms", "News mirror cache TTL.");
        describe_gauge!("mirror_market_cache_ttl_ms", "Market mirror cache TTL.");
    });
}

impl Metrics {
    /// Install the global Prometheus recorder. Fails if one is already set.
    pub fn init() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;
        describe_series();

        metrics::gauge!("mirror_news_cache_ttl_ms").set(NEWS_TTL.as_millis() as f64);
        metrics::gauge!("mirror_market_cache_ttl_ms").set(MARKET_TTL.as_millis() as f64);

        Ok(Self { handle })
    }

    /// `GET /metrics` in the Prometheus exposition format.
    pub fn router<S>(&self) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
