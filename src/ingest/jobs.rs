// src/ingest/jobs.rs
//! The dashboard's data classes wired to their fetchers. Store keys are
//! `{class}` or `{class}.{panel}`.

use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::context::FetchContext;
use crate::error::FetchError;
use crate::ingest::providers::{conflicts, markets, quakes, special};
use crate::ingest::scheduler::{DataClass, DataJob};
use crate::ingest::types::FetchOptions;

const POLYMARKET_LIMIT: usize = 20;
const CONGRESS_LIMIT: usize = 50;
const CONTRACTS_LIMIT: usize = 25;

pub fn default_jobs(ctx: &FetchContext) -> Vec<Arc<dyn DataJob>> {
    DataClass::ALL
        .into_iter()
        .map(|class| {
            Arc::new(PanelJob {
                class,
                ctx: ctx.clone(),
            }) as Arc<dyn DataJob>
        })
        .collect()
}

struct PanelJob {
    class: DataClass,
    ctx: FetchContext,
}

fn to_json<T: Serialize>(res: Result<T, FetchError>) -> Result<Value, FetchError> {
    res.and_then(|v| Ok(serde_json::to_value(v)?))
}

/// Keep what succeeded; fail the class only when every panel failed.
fn settle(
    class: DataClass,
    results: Vec<(&str, Result<Value, FetchError>)>,
) -> anyhow::Result<Vec<(String, Value)>> {
    let mut ok = Vec::with_capacity(results.len());
    let mut failed = Vec::new();
    for (key, res) in results {
        match res {
            Ok(v) => ok.push((key.to_string(), v)),
            Err(e) => failed.push(format!("{key}: {e}")),
        }
    }
    if ok.is_empty() && !failed.is_empty() {
        bail!("all {} panels failed: {}", class.as_str(), failed.join("; "));
    }
    if !failed.is_empty() {
        warn!(class = class.as_str(), failed = %failed.join("; "), "partial refresh");
    }
    Ok(ok)
}

#[async_trait]
impl DataJob for PanelJob {
    fn class(&self) -> DataClass {
        self.class
    }

    async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<Vec<(String, Value)>> {
        let ctx = &self.ctx;
        match self.class {
            DataClass::News => {
                let items = crate::ingest::fetch_all_news(ctx, FetchOptions::default(), cancel).await;
                // Sources never fail loudly; an empty merge over a non-empty
                // registry means nothing answered, so keep the last good list.
                if items.is_empty() && !ctx.sources.news.is_empty() {
                    bail!("no news source answered ({} configured)", ctx.sources.news.len());
                }
                Ok(vec![("news".into(), serde_json::to_value(items)?)])
            }
            DataClass::Conflicts => {
                let events = conflicts::fetch_live_conflict_events(ctx, cancel).await?;
                Ok(vec![("conflicts".into(), serde_json::to_value(events)?)])
            }
            DataClass::Earthquakes => {
                let quakes = quakes::fetch_earthquakes(ctx, cancel).await?;
                Ok(vec![("earthquakes".into(), serde_json::to_value(quakes)?)])
            }
            DataClass::Markets => {
                let (indices, sectors, commodities, crypto, polymarket) = tokio::join!(
                    markets::fetch_market_indices(ctx, cancel),
                    markets::fetch_sector_data(ctx, cancel),
                    markets::fetch_commodity_data(ctx, cancel),
                    markets::fetch_crypto_prices(ctx, cancel),
                    markets::fetch_polymarket_events(ctx, POLYMARKET_LIMIT, cancel),
                );
                settle(
                    self.class,
                    vec![
                        ("markets.indices", to_json(indices)),
                        ("markets.sectors", to_json(sectors)),
                        ("markets.commodities", to_json(commodities)),
                        ("markets.crypto", to_json(crypto)),
                        ("markets.polymarket", to_json(polymarket)),
                    ],
                )
            }
            DataClass::Special => {
                let (fed, congress, whales, contracts) = tokio::join!(
                    special::fetch_fed_data(ctx, cancel),
                    special::fetch_congress_trades(ctx, CONGRESS_LIMIT, cancel),
                    special::fetch_whale_transactions(ctx, cancel),
                    special::fetch_gov_contracts(ctx, CONTRACTS_LIMIT, cancel),
                );
                settle(
                    self.class,
                    vec![
                        ("special.fed", to_json(fed)),
                        ("special.congress", to_json(congress)),
                        ("special.whales", to_json(whales)),
                        ("special.contracts", to_json(contracts)),
                    ],
                )
            }
        }
    }
}
