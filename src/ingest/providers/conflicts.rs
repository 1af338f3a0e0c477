// src/ingest/providers/conflicts.rs
//! Geolocated conflict events: ACLED when credentials are configured, GDELT's
//! keyless GEO API otherwise (and whenever ACLED fails).

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::AcledCredentials;
use crate::context::FetchContext;
use crate::error::FetchError;
use crate::ingest::providers::lenient_f64;
use crate::ingest::strip_html;

const ACLED_READ: &str = "https://api.acleddata.com/acled/read";
const GDELT_GEO: &str = "https://api.gdeltproject.org/api/v2/geo/geo";
const GDELT_QUERY: &str = "(airstrike OR shelling OR missile OR clashes OR attack OR military)";
const ACLED_LOOKBACK_DAYS: i64 = 7;
const ACLED_LIMIT: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEvent {
    pub id: String,
    pub lat: f64,
    pub lon: f64,
    pub severity: Severity,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub timestamp: DateTime<Utc>,
    pub source: String,
}

static RE_HIGH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(killed|dead|deaths|massacre|airstrikes?|bombing|casualties)\b")
        .expect("high-severity regex")
});
static RE_MEDIUM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(attacks?|clash(es)?|explosions?|shelling|missiles?|drones?|raids?)\b")
        .expect("medium-severity regex")
});

pub fn severity_from_fatalities(fatalities: u32, event_type: &str) -> Severity {
    let by_count = match fatalities {
        10..=u32::MAX => Severity::Critical,
        3..=9 => Severity::High,
        1..=2 => Severity::Medium,
        0 => Severity::Low,
    };
    if event_type.eq_ignore_ascii_case("Explosions/Remote violence") {
        by_count.max(Severity::Medium)
    } else {
        by_count
    }
}

pub fn severity_from_text(text: &str) -> Severity {
    if RE_HIGH.is_match(text) {
        Severity::High
    } else if RE_MEDIUM.is_match(text) {
        Severity::Medium
    } else {
        Severity::Low
    }
}

pub fn acled_url(creds: &AcledCredentials, now: DateTime<Utc>) -> Result<String, FetchError> {
    let to = now.date_naive();
    let from = to - ChronoDuration::days(ACLED_LOOKBACK_DAYS);
    let window = format!("{from}|{to}");
    let limit = ACLED_LIMIT.to_string();
    let url = url::Url::parse_with_params(
        ACLED_READ,
        &[
            ("key", creds.key.as_str()),
            ("email", creds.email.as_str()),
            ("event_date", window.as_str()),
            ("event_date_where", "BETWEEN"),
            ("limit", limit.as_str()),
        ],
    )
    .map_err(|e| FetchError::Parse(e.to_string()))?;
    Ok(url.into())
}

pub fn gdelt_url() -> Result<String, FetchError> {
    let url = url::Url::parse_with_params(
        GDELT_GEO,
        &[
            ("query", GDELT_QUERY),
            ("format", "GeoJSON"),
            ("timespan", "24h"),
        ],
    )
    .map_err(|e| FetchError::Parse(e.to_string()))?;
    Ok(url.into())
}

#[derive(Debug, Deserialize)]
struct AcledEnvelope {
    #[serde(default)]
    data: Vec<Value>,
}

pub fn parse_acled(raw: &str) -> Result<Vec<ConflictEvent>, FetchError> {
    let env: AcledEnvelope = serde_json::from_str(raw)?;
    Ok(env
        .data
        .iter()
        .filter_map(|row| {
            let str_field = |k: &str| row.get(k).and_then(Value::as_str).unwrap_or_default();
            let lat = row.get("latitude").and_then(lenient_f64)?;
            let lon = row.get("longitude").and_then(lenient_f64)?;
            let fatalities = row
                .get("fatalities")
                .and_then(lenient_f64)
                .map(|f| f.max(0.0) as u32)
                .unwrap_or(0);
            let event_type = str_field("event_type");
            let timestamp = NaiveDate::parse_from_str(str_field("event_date"), "%Y-%m-%d")
                .ok()?
                .and_hms_opt(0, 0, 0)?
                .and_utc();

            let location = [str_field("location"), str_field("country")]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(", ");
            let sub_type = str_field("sub_event_type");
            let headline = if sub_type.is_empty() { event_type } else { sub_type };

            Some(ConflictEvent {
                id: format!("acled-{}", str_field("event_id_cnty")),
                lat,
                lon,
                severity: severity_from_fatalities(fatalities, event_type),
                kind: event_type.to_string(),
                title: if location.is_empty() {
                    headline.to_string()
                } else {
                    format!("{headline} in {location}")
                },
                timestamp,
                source: "acled".into(),
            })
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct GeoCollection {
    #[serde(default)]
    features: Vec<Value>,
}

/// GDELT points carry no event time; `now` is used.
pub fn parse_gdelt(raw: &str, now: DateTime<Utc>) -> Result<Vec<ConflictEvent>, FetchError> {
    let fc: GeoCollection = serde_json::from_str(raw)?;
    Ok(fc
        .features
        .iter()
        .enumerate()
        .filter_map(|(idx, f)| {
            let coords = f.pointer("/geometry/coordinates")?.as_array()?;
            let lon = coords.first()?.as_f64()?;
            let lat = coords.get(1)?.as_f64()?;
            let props = f.get("properties")?;
            let name = props.get("name").and_then(Value::as_str).unwrap_or_default();
            let html = props.get("html").and_then(Value::as_str).unwrap_or_default();
            let context = strip_html(html);
            let title = if name.trim().is_empty() {
                context.clone()
            } else {
                name.trim().to_string()
            };
            if title.is_empty() {
                return None;
            }
            Some(ConflictEvent {
                id: format!("gdelt-{idx}-{lat:.3}-{lon:.3}"),
                lat,
                lon,
                severity: severity_from_text(&format!("{title} {context}")),
                kind: "News report".into(),
                title,
                timestamp: now,
                source: "gdelt".into(),
            })
        })
        .collect())
}

pub async fn fetch_live_conflict_events(
    ctx: &FetchContext,
    cancel: &CancellationToken,
) -> Result<Vec<ConflictEvent>, FetchError> {
    let now = Utc::now();
    if let Some(creds) = &ctx.config.acled {
        let url = acled_url(creds, now)?;
        let res = ctx
            .breakers
            .execute("acled", || async {
                let resp = ctx.gateway.fetch_direct(&url, cancel).await?;
                parse_acled(&resp.body)
            })
            .await;
        match res {
            Ok(events) if !events.is_empty() => return Ok(events),
            Ok(_) => warn!("ACLED returned no events, falling back to GDELT"),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => warn!(error = %e, "ACLED unavailable, falling back to GDELT"),
        }
    }

    let url = gdelt_url()?;
    ctx.breakers
        .execute("gdelt", || async {
            let resp = ctx
                .gateway
                .fetch_through_gateway(&url, cancel)
                .await?
                .ok_or_else(|| FetchError::Unreachable(url.clone()))?;
            parse_gdelt(&resp.body, now)
        })
        .await
}
