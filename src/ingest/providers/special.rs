// src/ingest/providers/special.rs
//! The "special" panel: Fed press releases, congressional trades, large
//! on-chain BTC transfers and federal contract awards.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::context::FetchContext;
use crate::error::FetchError;
use crate::gateway::HttpRequest;
use crate::ingest::parser::FeedParser;
use crate::ingest::providers::{fetch_text, lenient_f64};
use crate::ingest::types::{BiasInfo, NewsItem, Reliability};

pub const FED_PRESS_FEED: &str = "https://www.federalreserve.gov/feeds/press_all.xml";
pub const HOUSE_TRADES: &str =
    "https://house-stock-watcher-data.s3-us-west-2.amazonaws.com/data/all_transactions.json";
pub const BLOCKCHAIN_UNCONFIRMED: &str = "https://blockchain.info/unconfirmed-transactions?format=json";
pub const USASPENDING_AWARDS: &str = "https://api.usaspending.gov/api/v2/search/spending_by_award/";

pub const WHALE_THRESHOLD_BTC: f64 = 50.0;
const SATOSHI_PER_BTC: f64 = 100_000_000.0;
const CONTRACT_LOOKBACK_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CongressTrade {
    pub representative: String,
    pub ticker: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub amount: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disclosure_date: Option<NaiveDate>,
    pub asset: String,
    pub district: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhaleTransaction {
    pub hash: String,
    pub amount_btc: f64,
    pub time: DateTime<Utc>,
    pub chain: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GovContract {
    pub award_id: String,
    pub recipient: String,
    pub amount: f64,
    pub agency: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    pub url: String,
}

pub async fn fetch_fed_data(
    ctx: &FetchContext,
    cancel: &CancellationToken,
) -> Result<Vec<NewsItem>, FetchError> {
    let bias = BiasInfo::new(0, Reliability::High);
    let parser = FeedParser::new();
    ctx.breakers
        .execute("fed", || async {
            let resp = ctx
                .gateway
                .fetch_through_gateway(FED_PRESS_FEED, cancel)
                .await?
                .ok_or_else(|| FetchError::Unreachable(FED_PRESS_FEED.to_string()))?;
            let mut items = parser.parse(&resp.body, "fed", &bias)?;
            for it in &mut items {
                it.source_name = "Federal Reserve".into();
            }
            Ok(items)
        })
        .await
}

fn parse_us_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%m/%d/%Y"))
        .ok()
}

/// Most recent `limit` trades by transaction date; rows without a ticker
/// (the upstream writes "--") are dropped.
pub fn parse_congress_trades(raw: &str, limit: usize) -> Result<Vec<CongressTrade>, FetchError> {
    let rows: Vec<Value> = serde_json::from_str(raw)?;
    let mut trades: Vec<CongressTrade> = rows
        .iter()
        .filter_map(|r| {
            let s = |k: &str| r.get(k).and_then(Value::as_str).unwrap_or_default().trim();
            let ticker = s("ticker");
            if ticker.is_empty() || ticker == "--" {
                return None;
            }
            Some(CongressTrade {
                representative: s("representative").to_string(),
                ticker: ticker.to_string(),
                kind: s("type").to_string(),
                amount: s("amount").to_string(),
                transaction_date: parse_us_date(s("transaction_date")),
                disclosure_date: parse_us_date(s("disclosure_date")),
                asset: s("asset_description").to_string(),
                district: s("district").to_string(),
            })
        })
        .collect();

    // None sorts first ascending, so last after the reversal.
    trades.sort_by(|a, b| b.transaction_date.cmp(&a.transaction_date));
    trades.truncate(limit);
    Ok(trades)
}

pub async fn fetch_congress_trades(
    ctx: &FetchContext,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<Vec<CongressTrade>, FetchError> {
    ctx.breakers
        .execute("congress", || async {
            let body = ctx.gateway.fetch_direct(HOUSE_TRADES, cancel).await?.body;
            parse_congress_trades(&body, limit)
        })
        .await
}

#[derive(Debug, Deserialize)]
struct UnconfirmedTxs {
    #[serde(default)]
    txs: Vec<RawTx>,
}

#[derive(Debug, Deserialize)]
struct RawTx {
    hash: String,
    #[serde(default)]
    time: i64,
    #[serde(default)]
    out: Vec<RawOutput>,
}

#[derive(Debug, Deserialize)]
struct RawOutput {
    #[serde(default)]
    value: u64,
}

pub fn parse_whales(raw: &str, threshold_btc: f64) -> Result<Vec<WhaleTransaction>, FetchError> {
    let parsed: UnconfirmedTxs = serde_json::from_str(raw)?;
    let mut whales: Vec<WhaleTransaction> = parsed
        .txs
        .into_iter()
        .filter_map(|tx| {
            // Upstream values are unchecked.
            let sats = tx.out.iter().fold(0u64, |acc, o| acc.saturating_add(o.value));
            let amount_btc = sats as f64 / SATOSHI_PER_BTC;
            if amount_btc < threshold_btc {
                return None;
            }
            Some(WhaleTransaction {
                url: format!("https://www.blockchain.com/explorer/transactions/btc/{}", tx.hash),
                time: DateTime::<Utc>::from_timestamp(tx.time, 0).unwrap_or_else(Utc::now),
                hash: tx.hash,
                amount_btc,
                chain: "BTC".into(),
            })
        })
        .collect();
    whales.sort_by(|a, b| b.amount_btc.total_cmp(&a.amount_btc));
    Ok(whales)
}

pub async fn fetch_whale_transactions(
    ctx: &FetchContext,
    cancel: &CancellationToken,
) -> Result<Vec<WhaleTransaction>, FetchError> {
    let body = fetch_text(ctx, "blockchain", BLOCKCHAIN_UNCONFIRMED, cancel).await?;
    parse_whales(&body, WHALE_THRESHOLD_BTC)
}

pub fn contracts_query(now: DateTime<Utc>, limit: usize) -> Value {
    let end = now.date_naive();
    let start = end - ChronoDuration::days(CONTRACT_LOOKBACK_DAYS);
    json!({
        "filters": {
            "award_type_codes": ["A", "B", "C", "D"],
            "time_period": [{"start_date": start.to_string(), "end_date": end.to_string()}]
        },
        "fields": [
            "Award ID", "Recipient Name", "Award Amount",
            "Awarding Agency", "Description", "Start Date"
        ],
        "sort": "Award Amount",
        "order": "desc",
        "limit": limit,
        "page": 1
    })
}

pub fn parse_contracts(raw: &str) -> Result<Vec<GovContract>, FetchError> {
    #[derive(Deserialize)]
    struct Page {
        #[serde(default)]
        results: Vec<Value>,
    }
    let page: Page = serde_json::from_str(raw)?;
    Ok(page
        .results
        .iter()
        .filter_map(|r| {
            let s = |k: &str| r.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
            let award_id = s("Award ID");
            if award_id.is_empty() {
                return None;
            }
            let url = match r.get("generated_internal_id").and_then(Value::as_str) {
                Some(internal) => format!("https://www.usaspending.gov/award/{internal}"),
                None => "https://www.usaspending.gov/search".to_string(),
            };
            Some(GovContract {
                award_id,
                recipient: s("Recipient Name"),
                amount: r.get("Award Amount").and_then(lenient_f64).unwrap_or(0.0),
                agency: s("Awarding Agency"),
                description: s("Description"),
                start_date: r.get("Start Date").and_then(Value::as_str).map(str::to_string),
                url,
            })
        })
        .collect())
}

/// USAspending only takes POST, which the CORS mirrors cannot relay, so this
/// always goes direct.
pub async fn fetch_gov_contracts(
    ctx: &FetchContext,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<Vec<GovContract>, FetchError> {
    let req = HttpRequest::post_json(USASPENDING_AWARDS, &contracts_query(Utc::now(), limit));
    ctx.breakers
        .execute("usaspending", || async {
            let resp = ctx.gateway.send(req, cancel).await?;
            parse_contracts(&resp.body)
        })
        .await
}
