// tests/common/mod.rs
//! Shared builders for the integration tests. Everything goes through
//! `MockTransport`; no test opens a socket.
#![allow(dead_code)]

use std::sync::Arc;

use chrono::DateTime;
use situation_monitor::config::AppConfig;
use situation_monitor::gateway::MockTransport;
use situation_monitor::ingest::config::{NewsSource, SourceRegistry};
use situation_monitor::ingest::types::Reliability;
use situation_monitor::FetchContext;

pub const RSS_THREE: &str = include_str!("../fixtures/rss_three.xml");
pub const NITTER_FEED: &str = include_str!("../fixtures/nitter_feed.xml");
pub const YAHOO_CHART: &str = include_str!("../fixtures/yahoo_chart.json");
pub const USGS_DAY: &str = include_str!("../fixtures/usgs_day.geojson");

/// Minimal RSS 2.0 document; `items` are (title, unix seconds).
pub fn rss(channel: &str, items: &[(&str, i64)]) -> String {
    let mut out = format!(
        "<?xml version=\"1.0\"?><rss version=\"2.0\"><channel><title>{channel}</title>"
    );
    for (title, ts) in items {
        let date = DateTime::from_timestamp(*ts, 0).unwrap().to_rfc2822();
        out.push_str(&format!(
            "<item><title>{title}</title><link>https://{channel}.test/{ts}</link>\
             <description>{title} body</description><pubDate>{date}</pubDate></item>"
        ));
    }
    out.push_str("</channel></rss>");
    out
}

pub fn source(id: &str, url: &str) -> NewsSource {
    NewsSource {
        id: id.into(),
        name: id.to_uppercase(),
        url: url.into(),
        bias: 0,
        reliability: Reliability::Medium,
        category: None,
    }
}

pub fn registry(news: Vec<NewsSource>) -> SourceRegistry {
    SourceRegistry {
        news,
        ..SourceRegistry::default()
    }
}

pub fn ctx_with(mock: &Arc<MockTransport>, config: AppConfig, sources: SourceRegistry) -> FetchContext {
    FetchContext::with_transport(mock.clone(), config, sources)
}

pub fn ctx(mock: &Arc<MockTransport>, news: Vec<NewsSource>) -> FetchContext {
    ctx_with(mock, AppConfig::default(), registry(news))
}
