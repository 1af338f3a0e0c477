// src/ingest/mod.rs
pub mod config;
pub mod extract;
pub mod jobs;
pub mod parser;
pub mod providers;
pub mod scheduler;
pub mod types;

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::context::FetchContext;
use crate::error::FetchError;
use crate::gateway::ProxyGateway;
use crate::ingest::config::NewsSource;
use crate::ingest::parser::FeedParser;
use crate::ingest::types::{FetchOptions, NewsItem};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("feed_items_parsed_total", "Items produced by the feed parser.");
        describe_counter!("feed_parse_errors_total", "Feeds that failed to parse.");
        describe_counter!(
            "aggregate_filtered_total",
            "Items dropped by the merge step (empty title)."
        );
        describe_counter!("aggregate_dedup_total", "Items removed as duplicate titles.");
        describe_counter!(
            "aggregate_source_errors_total",
            "Per-source fetch/parse failures during aggregation."
        );
        describe_counter!(
            "gateway_mirror_fallbacks_total",
            "Fetches served by a CORS proxy mirror."
        );
        describe_counter!("gateway_unreachable_total", "Fetches where every route failed.");
        describe_counter!("breaker_open_total", "Circuit transitions into OPEN.");
        describe_counter!("breaker_rejected_total", "Calls rejected by an open circuit.");
        describe_histogram!("feed_parse_ms", "Feed parse time in milliseconds.");
        describe_gauge!(
            "aggregate_last_run_ts",
            "Unix ts when news aggregation last finished."
        );
    });
}

static RE_SKIP_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>").expect("skip-block regex")
});
static RE_BLOCK_TAGS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</?(?:p|br|div|li|ul|ol|h[1-6]|tr|td|table|blockquote|figure|figcaption|hr)\b[^>]*>")
        .expect("block-tag regex")
});
static RE_TAGS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)</?[A-Za-z!?][^>]*>").expect("tag regex"));
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Plain text from feed HTML: CDATA markers, tags and entities removed,
/// whitespace collapsed.
pub fn strip_html(s: &str) -> String {
    let mut out = s.replace("<![CDATA[", "").replace("]]>", "");
    out = RE_SKIP_BLOCKS.replace_all(&out, " ").into_owned();
    out = RE_BLOCK_TAGS.replace_all(&out, " ").into_owned();
    out = RE_TAGS.replace_all(&out, "").into_owned();

    // Markup that arrived entity-escaped only becomes visible after decoding.
    out = html_escape::decode_html_entities(&out).into_owned();
    out = RE_BLOCK_TAGS.replace_all(&out, " ").into_owned();
    out = RE_TAGS.replace_all(&out, "").into_owned();

    RE_WS.replace_all(&out, " ").trim().to_string()
}

/// Dedup key: two items with this key equal are the same article.
pub fn dedup_key(title: &str) -> String {
    title.trim().to_lowercase()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub filtered: usize,
    pub deduped: usize,
    pub truncated: usize,
}

/// Drop untitled items, sort newest first (stable, so feed order breaks
/// ties), keep the first of each title, truncate to `limit`.
pub fn merge_with_stats(items: Vec<NewsItem>, limit: usize) -> (Vec<NewsItem>, MergeStats) {
    let mut stats = MergeStats::default();

    let mut kept: Vec<NewsItem> = Vec::with_capacity(items.len());
    for it in items {
        if it.title.trim().is_empty() {
            stats.filtered += 1;
            continue;
        }
        kept.push(it);
    }

    kept.sort_by(|a, b| b.pub_date.cmp(&a.pub_date));

    let mut seen: HashSet<String> = HashSet::with_capacity(kept.len());
    let before = kept.len();
    kept.retain(|it| seen.insert(dedup_key(&it.title)));
    stats.deduped = before - kept.len();

    if kept.len() > limit {
        stats.truncated = kept.len() - limit;
        kept.truncate(limit);
    }
    (kept, stats)
}

pub fn merge_news(items: Vec<NewsItem>, limit: usize) -> Vec<NewsItem> {
    merge_with_stats(items, limit).0
}

/// Multi-source news fetcher.
///
/// Batch mode fetches sources in fixed-size groups, each group settling fully
/// before the next starts. Fast mode races every source and returns as soon
/// as the merged result reaches `limit`, cancelling whatever is still in
/// flight; the result can therefore hold fewer unique items than a full wait
/// would have produced.
pub struct NewsAggregator {
    gateway: Arc<ProxyGateway>,
    breakers: Arc<CircuitBreakerRegistry>,
    sources: Vec<NewsSource>,
    batch_size: usize,
}

impl NewsAggregator {
    pub fn new(
        gateway: Arc<ProxyGateway>,
        breakers: Arc<CircuitBreakerRegistry>,
        sources: Vec<NewsSource>,
    ) -> Self {
        Self {
            gateway,
            breakers,
            sources,
            batch_size: 8,
        }
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn sources(&self) -> &[NewsSource] {
        &self.sources
    }

    pub async fn fetch_all(&self, opts: FetchOptions, cancel: &CancellationToken) -> Vec<NewsItem> {
        ensure_metrics_described();
        if opts.limit == 0 || self.sources.is_empty() {
            return Vec::new();
        }

        let items = if opts.fast_mode {
            self.fetch_fast(opts.limit, cancel).await
        } else {
            self.fetch_batched(opts.limit, cancel).await
        };

        gauge!("aggregate_last_run_ts").set(chrono::Utc::now().timestamp() as f64);
        info!(
            target: "ingest",
            kept = items.len(),
            sources = self.sources.len(),
            fast = opts.fast_mode,
            "news aggregation finished"
        );
        items
    }

    async fn fetch_batched(&self, limit: usize, cancel: &CancellationToken) -> Vec<NewsItem> {
        let parser = FeedParser::uncapped();
        let mut collected = Vec::new();

        for batch in self.sources.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                break;
            }
            let settled = futures::future::join_all(
                batch
                    .iter()
                    .map(|s| self.fetch_source(s, &parser, cancel.child_token())),
            )
            .await;
            collected.extend(settled.into_iter().flatten());
        }

        let (items, stats) = merge_with_stats(collected, limit);
        counter!("aggregate_filtered_total").increment(stats.filtered as u64);
        counter!("aggregate_dedup_total").increment(stats.deduped as u64);
        items
    }

    async fn fetch_fast(&self, limit: usize, cancel: &CancellationToken) -> Vec<NewsItem> {
        let parser = FeedParser::new();
        let race = cancel.child_token();

        let mut pending: FuturesUnordered<_> = self
            .sources
            .iter()
            .map(|s| self.fetch_source(s, &parser, race.child_token()))
            .collect();

        let mut acc: Vec<NewsItem> = Vec::new();
        while let Some(items) = pending.next().await {
            if items.is_empty() {
                continue;
            }
            acc.extend(items);
            acc = merge_news(acc, limit);
            if acc.len() >= limit {
                race.cancel();
                debug!(
                    target: "ingest",
                    remaining = pending.len(),
                    "fast mode reached limit, cancelling stragglers"
                );
                break;
            }
        }
        acc
    }

    /// Never fails: every error is logged here and yields no items.
    async fn fetch_source(
        &self,
        source: &NewsSource,
        parser: &FeedParser,
        cancel: CancellationToken,
    ) -> Vec<NewsItem> {
        let endpoint = format!("rss:{}", source.id);
        let res = self
            .breakers
            .execute(&endpoint, || async {
                let resp = self
                    .gateway
                    .fetch_through_gateway(&source.url, &cancel)
                    .await?
                    .ok_or_else(|| FetchError::Unreachable(source.url.clone()))?;
                parser.parse(&resp.body, &source.id, &source.bias_info())
            })
            .await;

        match res {
            Ok(mut items) => {
                for it in &mut items {
                    it.source_name = source.name.clone();
                    if it.category.is_none() {
                        it.category = source.category.clone();
                    }
                }
                items
            }
            Err(e) if e.is_cancelled() || e.is_circuit_open() => {
                debug!(target: "ingest", source = %source.id, reason = %e, "source skipped");
                Vec::new()
            }
            Err(e) => {
                counter!("aggregate_source_errors_total").increment(1);
                warn!(target: "ingest", source = %source.id, error = %e, "source fetch failed");
                Vec::new()
            }
        }
    }
}

/// Client-facing entry point: the backend mirror when one is configured,
/// local aggregation otherwise or when the backend is unavailable.
pub async fn fetch_all_news(
    ctx: &FetchContext,
    opts: FetchOptions,
    cancel: &CancellationToken,
) -> Vec<NewsItem> {
    let path = format!("news-aggregator?limit={}", opts.limit);
    match ctx.backend_json::<Vec<NewsItem>>("backend:news", &path, cancel).await {
        Some(Ok(items)) => return merge_news(items, opts.limit),
        Some(Err(e)) if e.is_cancelled() => return Vec::new(),
        Some(Err(e)) => warn!(error = %e, "backend news unavailable, aggregating locally"),
        None => {}
    }
    ctx.news_aggregator().fetch_all(opts, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::Reliability;
    use chrono::{DateTime, Utc};

    fn item(title: &str, ts: i64) -> NewsItem {
        NewsItem {
            id: format!("t-{ts}"),
            title: title.into(),
            description: String::new(),
            full_description: String::new(),
            link: String::new(),
            pub_date: DateTime::<Utc>::from_timestamp(ts, 0).unwrap(),
            source: "t".into(),
            source_name: "T".into(),
            category: None,
            image_url: None,
            video_url: None,
            video_type: None,
            bias: 0,
            bias_label: "Center".into(),
            reliability: Reliability::Medium,
        }
    }

    #[test]
    fn strip_html_handles_cdata_entities_and_tags() {
        assert_eq!(strip_html("  Hello,&nbsp;&nbsp; <b>world</b>!  "), "Hello, world!");
        assert_eq!(strip_html("<![CDATA[<p>One</p><p>Two</p>]]>"), "One Two");
        assert_eq!(strip_html("&lt;em&gt;escaped&lt;/em&gt; markup"), "escaped markup");
        assert_eq!(strip_html("<script>var x = 1;</script>Body"), "Body");
        assert_eq!(strip_html("a &lt; b"), "a < b");
    }

    #[test]
    fn merge_sorts_dedupes_and_truncates() {
        let raw = vec![
            item("Older", 100),
            item("Breaking: Strait closed", 300),
            item("breaking: strait CLOSED ", 200),
            item("", 400),
            item("Middle", 250),
        ];
        let (out, stats) = merge_with_stats(raw, 10);
        let titles: Vec<_> = out.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["Breaking: Strait closed", "Middle", "Older"]);
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.deduped, 1);

        let capped = merge_news(out.clone(), 2);
        assert_eq!(capped.len(), 2);
        assert!(merge_news(out, 0).is_empty());
    }

    #[test]
    fn merge_is_idempotent() {
        let raw: Vec<NewsItem> = (0..40)
            .map(|i| item(&format!("Headline {}", i % 13), 1_000 + (i * 7919 % 97)))
            .collect();
        let once = merge_news(raw.clone(), 200);
        let twice = merge_news(once.clone(), 200);
        assert_eq!(once, twice);

        let keys: HashSet<_> = once.iter().map(|i| dedup_key(&i.title)).collect();
        assert_eq!(keys.len(), once.len());
        assert!(once.windows(2).all(|w| w[0].pub_date >= w[1].pub_date));
    }
}
