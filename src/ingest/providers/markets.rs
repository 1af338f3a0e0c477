// src/ingest/providers/markets.rs
//! Market quotes (Yahoo chart API), crypto spot prices (CoinGecko) and
//! prediction markets (Polymarket gamma API).

use std::fmt;
use std::str::FromStr;

use futures::future::join_all;
use percent_encoding::utf8_percent_encode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::FetchContext;
use crate::error::FetchError;
use crate::gateway::URI_COMPONENT;
use crate::ingest::providers::{fetch_json, lenient_f64};

const YAHOO_CHART: &str = "https://query1.finance.yahoo.com/v8/finance/chart/";
const COINGECKO_PRICE: &str = "https://api.coingecko.com/api/v3/simple/price";
const POLYMARKET_EVENTS: &str = "https://gamma-api.polymarket.com/events";

const INDICES: &[(&str, &str)] = &[
    ("^GSPC", "S&P 500"),
    ("^DJI", "Dow Jones"),
    ("^IXIC", "NASDAQ"),
    ("^RUT", "Russell 2000"),
    ("^VIX", "VIX"),
    ("^FTSE", "FTSE 100"),
    ("^N225", "Nikkei 225"),
    ("^GDAXI", "DAX"),
];

const SECTORS: &[(&str, &str)] = &[
    ("XLK", "Technology"),
    ("XLF", "Financials"),
    ("XLE", "Energy"),
    ("XLV", "Health Care"),
    ("XLI", "Industrials"),
    ("XLY", "Consumer Discretionary"),
    ("XLP", "Consumer Staples"),
    ("XLU", "Utilities"),
    ("XLB", "Materials"),
    ("XLRE", "Real Estate"),
    ("XLC", "Communication Services"),
];

const COMMODITIES: &[(&str, &str)] = &[
    ("GC=F", "Gold"),
    ("SI=F", "Silver"),
    ("CL=F", "Crude Oil"),
    ("NG=F", "Natural Gas"),
    ("HG=F", "Copper"),
    ("ZW=F", "Wheat"),
];

const CRYPTO: &[(&str, &str, &str)] = &[
    ("bitcoin", "BTC", "Bitcoin"),
    ("ethereum", "ETH", "Ethereum"),
    ("solana", "SOL", "Solana"),
    ("ripple", "XRP", "XRP"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Indices,
    Sectors,
    Commodities,
}

impl MarketKind {
    pub const ALL: [MarketKind; 3] = [Self::Indices, Self::Sectors, Self::Commodities];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Indices => "indices",
            Self::Sectors => "sectors",
            Self::Commodities => "commodities",
        }
    }

    pub fn symbols(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::Indices => INDICES,
            Self::Sectors => SECTORS,
            Self::Commodities => COMMODITIES,
        }
    }
}

impl fmt::Display for MarketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "indices" => Ok(Self::Indices),
            "sectors" => Ok(Self::Sectors),
            "commodities" => Ok(Self::Commodities),
            other => Err(format!(
                "invalid kind '{other}', expected indices|sectors|commodities"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub symbol: String,
    pub name: String,
    pub price: f64,
    pub change: f64,
    pub change_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoPrice {
    pub id: String,
    pub symbol: String,
    pub name: String,
    pub price_usd: f64,
    pub change_24h: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolymarketEvent {
    pub id: String,
    pub title: String,
    pub url: String,
    pub volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

pub fn chart_url(symbol: &str) -> String {
    format!(
        "{YAHOO_CHART}{}?interval=1d&range=5d",
        utf8_percent_encode(symbol, URI_COMPONENT)
    )
}

/// Quote from a chart response: last price against the previous close.
pub fn parse_chart(symbol: &str, name: &str, body: &Value) -> Result<Quote, FetchError> {
    let meta = body
        .pointer("/chart/result/0/meta")
        .ok_or_else(|| FetchError::Parse(format!("{symbol}: chart has no meta")))?;

    let price = meta
        .get("regularMarketPrice")
        .and_then(lenient_f64)
        .ok_or_else(|| FetchError::Parse(format!("{symbol}: missing regularMarketPrice")))?;
    let prev = meta
        .get("chartPreviousClose")
        .or_else(|| meta.get("previousClose"))
        .and_then(lenient_f64)
        .unwrap_or(price);

    let change = price - prev;
    let change_percent = if prev.abs() > f64::EPSILON {
        change / prev * 100.0
    } else {
        0.0
    };
    Ok(Quote {
        symbol: symbol.to_string(),
        name: name.to_string(),
        price,
        change,
        change_percent,
    })
}

/// All symbols of `kind` concurrently under breaker `yahoo`, in table order.
/// Partial results are fine; only a total wipe-out is an error.
pub async fn fetch_market_data(
    ctx: &FetchContext,
    kind: MarketKind,
    cancel: &CancellationToken,
) -> Result<Vec<Quote>, FetchError> {
    let results = join_all(kind.symbols().iter().map(|(symbol, name)| async move {
        let body: Value = fetch_json(ctx, "yahoo", &chart_url(symbol), cancel).await?;
        parse_chart(symbol, name, &body)
    }))
    .await;

    let mut quotes = Vec::with_capacity(results.len());
    let mut last_err = None;
    for res in results {
        match res {
            Ok(q) => quotes.push(q),
            Err(e) => {
                debug!(%kind, error = %e, "quote skipped");
                last_err = Some(e);
            }
        }
    }
    match (quotes.is_empty(), last_err) {
        (true, Some(e)) => Err(e),
        _ => Ok(quotes),
    }
}

/// Backend mirror first, Yahoo directly when it is absent or failing.
async fn fetch_kind(
    ctx: &FetchContext,
    kind: MarketKind,
    cancel: &CancellationToken,
) -> Result<Vec<Quote>, FetchError> {
    let path = format!("market-data?kind={kind}");
    match ctx.backend_json::<Vec<Quote>>("backend:markets", &path, cancel).await {
        Some(Ok(quotes)) => return Ok(quotes),
        Some(Err(e)) if e.is_cancelled() => return Err(e),
        Some(Err(e)) => warn!(%kind, error = %e, "backend market data unavailable, fetching directly"),
        None => {}
    }
    fetch_market_data(ctx, kind, cancel).await
}

pub async fn fetch_market_indices(
    ctx: &FetchContext,
    cancel: &CancellationToken,
) -> Result<Vec<Quote>, FetchError> {
    fetch_kind(ctx, MarketKind::Indices, cancel).await
}

pub async fn fetch_sector_data(
    ctx: &FetchContext,
    cancel: &CancellationToken,
) -> Result<Vec<Quote>, FetchError> {
    fetch_kind(ctx, MarketKind::Sectors, cancel).await
}

pub async fn fetch_commodity_data(
    ctx: &FetchContext,
    cancel: &CancellationToken,
) -> Result<Vec<Quote>, FetchError> {
    fetch_kind(ctx, MarketKind::Commodities, cancel).await
}

pub fn crypto_url() -> String {
    let ids: Vec<&str> = CRYPTO.iter().map(|(id, _, _)| *id).collect();
    format!(
        "{COINGECKO_PRICE}?ids={}&vs_currencies=usd&include_24hr_change=true",
        ids.join(",")
    )
}

pub fn parse_crypto(body: &Value) -> Vec<CryptoPrice> {
    CRYPTO
        .iter()
        .filter_map(|(id, symbol, name)| {
            let entry = body.get(*id)?;
            Some(CryptoPrice {
                id: id.to_string(),
                symbol: symbol.to_string(),
                name: name.to_string(),
                price_usd: entry.get("usd").and_then(lenient_f64)?,
                change_24h: entry.get("usd_24h_change").and_then(lenient_f64).unwrap_or(0.0),
            })
        })
        .collect()
}

pub async fn fetch_crypto_prices(
    ctx: &FetchContext,
    cancel: &CancellationToken,
) -> Result<Vec<CryptoPrice>, FetchError> {
    let body: Value = fetch_json(ctx, "coingecko", &crypto_url(), cancel).await?;
    Ok(parse_crypto(&body))
}

pub fn polymarket_url(limit: usize) -> String {
    format!("{POLYMARKET_EVENTS}?closed=false&order=volume&ascending=false&limit={limit}")
}

pub fn parse_polymarket(body: &Value) -> Result<Vec<PolymarketEvent>, FetchError> {
    let events = body
        .as_array()
        .ok_or_else(|| FetchError::Parse("polymarket: expected an array".into()))?;

    Ok(events
        .iter()
        .filter_map(|ev| {
            let title = ev.get("title")?.as_str()?.trim();
            if title.is_empty() {
                return None;
            }
            let id = match ev.get("id")? {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let slug = ev.get("slug").and_then(Value::as_str).unwrap_or(&id);
            Some(PolymarketEvent {
                url: format!("https://polymarket.com/event/{slug}"),
                id,
                title: title.to_string(),
                volume: ev.get("volume").and_then(lenient_f64).unwrap_or(0.0),
                end_date: ev.get("endDate").and_then(Value::as_str).map(str::to_string),
            })
        })
        .collect())
}

pub async fn fetch_polymarket_events(
    ctx: &FetchContext,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<Vec<PolymarketEvent>, FetchError> {
    let body: Value = fetch_json(ctx, "polymarket", &polymarket_url(limit), cancel).await?;
    parse_polymarket(&body)
}
