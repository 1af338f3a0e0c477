// src/ingest/providers/social.rs
//! OSINT social accounts read through Nitter-style RSS mirrors.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::FetchContext;
use crate::error::FetchError;
use crate::ingest::config::SocialAccount;
use crate::ingest::parser::FeedParser;
use crate::ingest::types::{BiasInfo, NewsItem, Reliability};

pub const DEFAULT_TWEET_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tweet {
    pub id: String,
    pub handle: String,
    pub author: String,
    pub text: String,
    pub link: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Tweet {
    fn from_item(item: NewsItem, account: &SocialAccount) -> Self {
        // Nitter titles are the tweet text truncated; the body has all of it.
        let text = if item.full_description.len() > item.title.len() {
            item.full_description
        } else {
            item.title
        };
        Self {
            id: item.id,
            handle: account.handle.clone(),
            author: account.name.clone(),
            text,
            link: item.link,
            timestamp: item.pub_date,
            image_url: item.image_url,
            category: account.category.clone().or(item.category),
        }
    }
}

/// Breaker key for a mirror: one breaker per mirror host, shared by every
/// account read through it.
pub fn mirror_endpoint(feed_url: &str) -> String {
    let host = url::Url::parse(feed_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| feed_url.to_string());
    format!("social:{host}")
}

/// Newest first, unique by case-folded text, at most `limit`.
pub fn merge_tweets(mut tweets: Vec<Tweet>, limit: usize) -> Vec<Tweet> {
    tweets.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let mut seen = HashSet::new();
    tweets.retain(|t| seen.insert(t.text.trim().to_lowercase()));
    tweets.truncate(limit);
    tweets
}

/// Client-facing: backend mirror when configured, local collection otherwise.
pub async fn fetch_twitter_intel(
    ctx: &FetchContext,
    limit: usize,
    cancel: &CancellationToken,
) -> Vec<Tweet> {
    let path = format!("twitter-intel?limit={limit}");
    match ctx.backend_json::<Vec<Tweet>>("backend:twitter", &path, cancel).await {
        Some(Ok(tweets)) => return merge_tweets(tweets, limit),
        Some(Err(e)) if e.is_cancelled() => return Vec::new(),
        Some(Err(e)) => warn!(error = %e, "backend twitter intel unavailable, collecting locally"),
        None => {}
    }
    collect_twitter_intel(ctx, limit, cancel).await
}

/// Every configured account concurrently; each account tries its mirrors in
/// order and the first one that yields posts wins.
pub async fn collect_twitter_intel(
    ctx: &FetchContext,
    limit: usize,
    cancel: &CancellationToken,
) -> Vec<Tweet> {
    if limit == 0 {
        return Vec::new();
    }
    let parser = FeedParser::new();
    let per_account = join_all(
        ctx.sources
            .social
            .iter()
            .map(|acct| fetch_account(ctx, acct, &parser, cancel)),
    )
    .await;
    merge_tweets(per_account.into_iter().flatten().collect(), limit)
}

async fn fetch_account(
    ctx: &FetchContext,
    account: &SocialAccount,
    parser: &FeedParser,
    cancel: &CancellationToken,
) -> Vec<Tweet> {
    let bias = BiasInfo::new(0, Reliability::Low);
    let source = format!("x-{}", account.handle.to_lowercase());

    for feed_url in account.feed_urls(&ctx.sources.social_mirrors) {
        let endpoint = mirror_endpoint(&feed_url);
        let res = ctx
            .breakers
            .execute(&endpoint, || async {
                let resp = ctx
                    .gateway
                    .fetch_through_gateway(&feed_url, cancel)
                    .await?
                    .ok_or_else(|| FetchError::Unreachable(feed_url.clone()))?;
                parser.parse(&resp.body, &source, &bias)
            })
            .await;

        match res {
            Ok(items) if !items.is_empty() => {
                return items
                    .into_iter()
                    .map(|it| Tweet::from_item(it, account))
                    .collect();
            }
            Ok(_) => debug!(handle = %account.handle, %endpoint, "mirror returned no posts"),
            Err(e) if e.is_cancelled() => return Vec::new(),
            Err(e) if e.is_circuit_open() => {
                debug!(handle = %account.handle, %endpoint, "mirror circuit open")
            }
            Err(e) => debug!(handle = %account.handle, %endpoint, error = %e, "mirror failed"),
        }
    }
    debug!(handle = %account.handle, "no mirror produced posts");
    Vec::new()
}
