// src/context.rs
use std::sync::Arc;

use anyhow::Context;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::breaker::{BreakerConfig, CircuitBreakerRegistry};
use crate::config::AppConfig;
use crate::error::FetchError;
use crate::gateway::{HttpRequest, HttpTransport, ProxyGateway, ReqwestTransport};
use crate::ingest::config::SourceRegistry;
use crate::ingest::NewsAggregator;

/// Everything a fetcher needs. The breaker registry inside lives as long as
/// the context: one per dashboard session, one per server process.
#[derive(Clone)]
pub struct FetchContext {
    pub gateway: Arc<ProxyGateway>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub sources: Arc<SourceRegistry>,
    pub config: Arc<AppConfig>,
}

impl FetchContext {
    pub fn new(gateway: ProxyGateway, config: AppConfig, sources: SourceRegistry) -> Self {
        Self {
            gateway: Arc::new(gateway),
            breakers: Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default())),
            sources: Arc::new(sources),
            config: Arc::new(config),
        }
    }

    /// Dashboard-side context: direct fetch with CORS mirror fallback.
    pub fn client(config: AppConfig, sources: SourceRegistry) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(config.http_timeout).context("building http client")?;
        Ok(Self::new(ProxyGateway::new(Arc::new(transport)), config, sources))
    }

    /// Server-side context: no CORS restriction, so no mirrors.
    pub fn server(config: AppConfig, sources: SourceRegistry) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(config.http_timeout).context("building http client")?;
        Ok(Self::new(
            ProxyGateway::direct_only(Arc::new(transport)),
            config,
            sources,
        ))
    }

    /// Direct-only context over an arbitrary transport (tests, embedding).
    pub fn with_transport(
        transport: Arc<dyn HttpTransport>,
        config: AppConfig,
        sources: SourceRegistry,
    ) -> Self {
        Self::new(ProxyGateway::direct_only(transport), config, sources)
    }

    pub fn with_breakers(mut self, breakers: CircuitBreakerRegistry) -> Self {
        self.breakers = Arc::new(breakers);
        self
    }

    pub fn news_aggregator(&self) -> NewsAggregator {
        NewsAggregator::new(
            self.gateway.clone(),
            self.breakers.clone(),
            self.sources.news.clone(),
        )
        .with_batch_size(self.config.news_batch_size)
    }

    /// GET a pre-merged payload from the backend mirror under breaker
    /// `endpoint`. `None` when no backend is configured.
    pub async fn backend_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        path: &str,
        cancel: &CancellationToken,
    ) -> Option<Result<T, FetchError>> {
        let backend = self.config.backend.as_ref()?;
        let mut req = HttpRequest::get(backend.url(path)).header("Accept", "application/json");
        if let Some(token) = &backend.bearer {
            req = req
                .header("Authorization", &format!("Bearer {token}"))
                .header("apikey", token);
        }

        let res = self
            .breakers
            .execute(endpoint, || async {
                let resp = self.gateway.send(req, cancel).await?;
                Ok(serde_json::from_str::<T>(&resp.body)?)
            })
            .await;
        Some(res)
    }
}
