// src/ingest/providers/mod.rs
//! Typed fetchers for the non-news dashboard panels.
//!
//! Single-upstream fetchers return `Result` so the coordinator can tell a
//! failed refresh from an empty one; multi-source fetchers (social) return
//! whatever subset arrived.

pub mod conflicts;
pub mod markets;
pub mod quakes;
pub mod social;
pub mod special;

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::context::FetchContext;
use crate::error::FetchError;

/// Gateway GET (direct, then mirrors) under breaker `endpoint`.
pub(crate) async fn fetch_text(
    ctx: &FetchContext,
    endpoint: &str,
    url: &str,
    cancel: &CancellationToken,
) -> Result<String, FetchError> {
    ctx.breakers
        .execute(endpoint, || async {
            ctx.gateway
                .fetch_through_gateway(url, cancel)
                .await?
                .map(|resp| resp.body)
                .ok_or_else(|| FetchError::Unreachable(url.to_string()))
        })
        .await
}

/// Like [`fetch_text`], decoding the body as JSON inside the breaker so a
/// garbage payload counts against the endpoint.
pub(crate) async fn fetch_json<T: DeserializeOwned>(
    ctx: &FetchContext,
    endpoint: &str,
    url: &str,
    cancel: &CancellationToken,
) -> Result<T, FetchError> {
    ctx.breakers
        .execute(endpoint, || async {
            let body = ctx
                .gateway
                .fetch_through_gateway(url, cancel)
                .await?
                .map(|resp| resp.body)
                .ok_or_else(|| FetchError::Unreachable(url.to_string()))?;
            Ok(serde_json::from_str::<T>(&body)?)
        })
        .await
}

/// Numbers that upstreams send either as JSON numbers or as strings.
pub(crate) fn lenient_f64(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}
