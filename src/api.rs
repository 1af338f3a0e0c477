// src/api.rs
//! Backend mirror: server-side versions of the news, market and social
//! fetchers, each behind a short-TTL cache and an origin allow-list.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, info};

use crate::cache::MirrorCaches;
use crate::context::FetchContext;
use crate::error::ApiError;
use crate::ingest::providers::markets::{self, MarketKind};
use crate::ingest::providers::social::{self, DEFAULT_TWEET_LIMIT};
use crate::ingest::types::{FetchOptions, NewsItem};

pub const MAX_NEWS_LIMIT: usize = 200;

#[derive(Clone)]
pub struct MirrorState {
    pub ctx: FetchContext,
    pub caches: Arc<MirrorCaches>,
}

impl MirrorState {
    pub fn new(ctx: FetchContext) -> Self {
        Self {
            ctx,
            caches: Arc::new(MirrorCaches::default()),
        }
    }
}

pub fn router(state: MirrorState) -> Router {
    let cors = cors_layer(&state.ctx.config.allowed_origins);
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/news-aggregator", get(news_aggregator).options(no_content))
        .route("/market-data", get(market_data).options(no_content))
        .route("/twitter-intel", get(twitter_intel).options(no_content))
        .route("/api/news", get(legacy_news).options(no_content))
        .layer(cors)
        .layer(middleware::from_fn(preflight_no_content))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(Duration::from_secs(86_400))
}

async fn no_content() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// CORS preflights answered by the layer come back as 200; report 204.
async fn preflight_no_content(req: Request, next: Next) -> Response {
    let is_options = req.method() == Method::OPTIONS;
    let mut resp = next.run(req).await;
    if is_options && resp.status() == StatusCode::OK {
        *resp.status_mut() = StatusCode::NO_CONTENT;
    }
    resp
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    limit: Option<String>,
}

impl LimitQuery {
    /// Unparsable or missing values fall back to `default`; never above `max`.
    fn resolve(&self, default: usize, max: usize) -> usize {
        self.limit
            .as_deref()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .unwrap_or(default)
            .min(max)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct KindQuery {
    kind: Option<String>,
}

fn cached<T: Serialize>(hit: bool, route: &'static str, body: T) -> Response {
    if hit {
        counter!("mirror_cache_hits_total", "route" => route).increment(1);
    } else {
        counter!("mirror_cache_misses_total", "route" => route).increment(1);
    }
    let tag = if hit { "HIT" } else { "MISS" };
    ([("X-Cache", tag)], Json(body)).into_response()
}

async fn news_aggregator(
    State(state): State<MirrorState>,
    Query(q): Query<LimitQuery>,
) -> Result<Response, ApiError> {
    let limit = q.resolve(MAX_NEWS_LIMIT, MAX_NEWS_LIMIT);
    if let Some(items) = state.caches.news.get_fresh() {
        return Ok(cached(true, "news", slice(items, limit)));
    }

    let opts = FetchOptions {
        limit: MAX_NEWS_LIMIT,
        fast_mode: false,
    };
    let items = state
        .ctx
        .news_aggregator()
        .fetch_all(opts, &CancellationToken::new())
        .await;
    info!(kept = items.len(), "news cache refilled");
    state.caches.news.put(items.clone());
    Ok(cached(false, "news", slice(items, limit)))
}

fn slice<T>(mut items: Vec<T>, limit: usize) -> Vec<T> {
    items.truncate(limit);
    items
}

async fn market_data(
    State(state): State<MirrorState>,
    Query(q): Query<KindQuery>,
) -> Result<Response, ApiError> {
    let kind: MarketKind = q
        .kind
        .as_deref()
        .unwrap_or("indices")
        .parse()
        .map_err(ApiError::BadRequest)?;

    let slot = state.caches.markets.slot(kind);
    if let Some(quotes) = slot.get_fresh() {
        return Ok(cached(true, "markets", quotes));
    }

    let quotes = markets::fetch_market_data(&state.ctx, kind, &CancellationToken::new()).await?;
    slot.put(quotes.clone());
    Ok(cached(false, "markets", quotes))
}

async fn twitter_intel(
    State(state): State<MirrorState>,
    Query(q): Query<LimitQuery>,
) -> Result<Response, ApiError> {
    let limit = q.resolve(DEFAULT_TWEET_LIMIT, MAX_NEWS_LIMIT);
    if let Some(tweets) = state.caches.twitter.get_fresh() {
        return Ok(cached(true, "twitter", slice(tweets, limit)));
    }

    let tweets =
        social::collect_twitter_intel(&state.ctx, MAX_NEWS_LIMIT, &CancellationToken::new()).await;
    state.caches.twitter.put(tweets.clone());
    Ok(cached(false, "twitter", slice(tweets, limit)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyEnvelope {
    pub success: bool,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale: Option<bool>,
    pub count: usize,
    pub news: Vec<NewsItem>,
}

impl LegacyEnvelope {
    fn from_cache(items: Vec<NewsItem>, age: Duration, stale: bool, limit: usize) -> Self {
        let news = slice(items, limit);
        Self {
            success: true,
            cached: true,
            cache_age: Some(age.as_millis() as u64),
            stale: stale.then_some(true),
            count: news.len(),
            news,
        }
    }
}

/// Older single-handler variant with an envelope. While one request is
/// refreshing, others get the stale copy instead of a second upstream fetch.
async fn legacy_news(
    State(state): State<MirrorState>,
    Query(q): Query<LimitQuery>,
) -> Result<Response, ApiError> {
    let limit = q.resolve(MAX_NEWS_LIMIT, MAX_NEWS_LIMIT);
    let slot = &state.caches.legacy_news;

    if let Some((items, age)) = slot.get_any() {
        if age < slot.ttl() {
            return Ok(cached(true, "legacy", LegacyEnvelope::from_cache(items, age, false, limit)));
        }
        if state.caches.legacy_refreshing.is_refreshing() {
            debug!("legacy refresh in progress, serving stale copy");
            return Ok(cached(true, "legacy", LegacyEnvelope::from_cache(items, age, true, limit)));
        }
    }

    // Without a stale copy there is nothing to fall back on, so a request that
    // loses the flag race fetches on its own.
    let _guard = state.caches.legacy_refreshing.try_begin();
    let opts = FetchOptions {
        limit: MAX_NEWS_LIMIT,
        fast_mode: false,
    };
    let items = state
        .ctx
        .news_aggregator()
        .fetch_all(opts, &CancellationToken::new())
        .await;
    slot.put(items.clone());

    let news = slice(items, limit);
    Ok(cached(
        false,
        "legacy",
        LegacyEnvelope {
            success: true,
            cached: false,
            cache_age: None,
            stale: None,
            count: news.len(),
            news,
        },
    ))
}
