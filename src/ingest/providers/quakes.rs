// src/ingest/providers/quakes.rs
//! USGS significant-earthquake feed. Public and CORS-enabled, so it is
//! fetched directly with no mirrors and no breaker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::context::FetchContext;
use crate::error::FetchError;

pub const USGS_FEED: &str =
    "https://earthquake.usgs.gov/earthquakes/feed/v1.0/summary/4.5_day.geojson";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Earthquake {
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    pub depth_km: f64,
    pub magnitude: f64,
    pub place: String,
    pub time: DateTime<Utc>,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    id: Option<String>,
    #[serde(default)]
    properties: Value,
    #[serde(default)]
    geometry: Value,
}

/// Features without a magnitude or coordinates are skipped. Newest first.
pub fn parse_usgs(raw: &str) -> Result<Vec<Earthquake>, FetchError> {
    let fc: FeatureCollection = serde_json::from_str(raw)?;

    let mut out: Vec<Earthquake> = fc
        .features
        .into_iter()
        .filter_map(|f| {
            let coords = f.geometry.get("coordinates")?.as_array()?;
            let lon = coords.first()?.as_f64()?;
            let lat = coords.get(1)?.as_f64()?;
            let depth_km = coords.get(2).and_then(Value::as_f64).unwrap_or(0.0);
            let p = &f.properties;
            let magnitude = p.get("mag")?.as_f64()?;
            let time = p
                .get("time")
                .and_then(Value::as_i64)
                .and_then(DateTime::<Utc>::from_timestamp_millis)?;
            Some(Earthquake {
                id: f.id.unwrap_or_else(|| format!("usgs-{}", time.timestamp_millis())),
                lat,
                lon,
                depth_km,
                magnitude,
                place: p
                    .get("place")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown location")
                    .to_string(),
                time,
                url: p.get("url").and_then(Value::as_str).unwrap_or_default().to_string(),
            })
        })
        .collect();

    out.sort_by(|a, b| b.time.cmp(&a.time));
    Ok(out)
}

pub async fn fetch_earthquakes(
    ctx: &FetchContext,
    cancel: &CancellationToken,
) -> Result<Vec<Earthquake>, FetchError> {
    let resp = ctx.gateway.fetch_direct(USGS_FEED, cancel).await?;
    parse_usgs(&resp.body)
}
