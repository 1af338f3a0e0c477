// tests/aggregate_news.rs
//
// Multi-source aggregation end to end over MockTransport.
//
// Covered:
// - malformed feed isolation (garbage from one source, others unaffected)
// - fast mode returns at the limit and cancels sources still in flight
// - batch mode merge invariants (limit, order, case-insensitive dedupe)
// - open circuits skip the network entirely
// - backend mirror preferred, local aggregation as fallback

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use situation_monitor::config::{AppConfig, BackendEndpoint};
use situation_monitor::gateway::MockTransport;
use situation_monitor::ingest::config::NewsSource;
use situation_monitor::{fetch_all_news, CircuitState, FetchOptions};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn opts(limit: usize, fast_mode: bool) -> FetchOptions {
    FetchOptions { limit, fast_mode }
}

#[tokio::test]
async fn malformed_feed_contributes_nothing_and_breaks_nothing() {
    let mock = Arc::new(MockTransport::new());
    mock.respond("https://a.test/rss", 200, common::RSS_THREE)
        .respond("https://b.test/rss", 200, "this is {not} xml at all");

    let ctx = common::ctx(
        &mock,
        vec![
            common::source("a", "https://a.test/rss"),
            common::source("b", "https://b.test/rss"),
        ],
    );
    let items = ctx
        .news_aggregator()
        .fetch_all(FetchOptions::default(), &CancellationToken::new())
        .await;

    assert_eq!(items.len(), 3);
    assert!(items.iter().all(|i| i.source == "a" && i.source_name == "A"));
    assert_eq!(items[0].title, "Ceasefire talks resume in Doha");
    assert_eq!(
        items[0].image_url.as_deref(),
        Some("https://img.alpha.example.test/doha.jpg")
    );
    assert_eq!(items[1].description, "Ships cleared inspection & left port.");

    let b = ctx.breakers.snapshot("rss:b").expect("breaker for b");
    assert_eq!(b.failure_count, 1, "parse failure is charged to the source");
    assert_eq!(ctx.breakers.snapshot("rss:a").unwrap().failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn fast_mode_stops_at_limit_and_cancels_stragglers() {
    let mock = Arc::new(MockTransport::new());
    let mut sources: Vec<NewsSource> = Vec::new();
    for i in 0..10u64 {
        let url = format!("https://s{i}.test/rss");
        let titles: Vec<String> = (0..5).map(|j| format!("Source {i} story {j}")).collect();
        let items: Vec<(&str, i64)> = titles
            .iter()
            .enumerate()
            .map(|(j, t)| (t.as_str(), 1_760_000_000 + (i as i64) * 100 + j as i64))
            .collect();
        mock.respond_after(
            &url,
            Duration::from_millis(100 * (i + 1)),
            200,
            &common::rss(&format!("s{i}"), &items),
        );
        sources.push(common::source(&format!("s{i}"), &url));
    }
    let ctx = common::ctx(&mock, sources);

    let started = Instant::now();
    let items = ctx
        .news_aggregator()
        .fetch_all(opts(8, true), &CancellationToken::new())
        .await;

    assert_eq!(items.len(), 8);
    let waited = started.elapsed();
    assert!(
        waited >= Duration::from_millis(200) && waited < Duration::from_millis(300),
        "should return right after the second source, waited {waited:?}"
    );
    let contributing: HashSet<_> = items.iter().map(|i| i.source.as_str()).collect();
    assert_eq!(contributing, HashSet::from(["s0", "s1"]));

    for i in 2..10 {
        let token = mock
            .token_for(&format!("https://s{i}.test/rss"))
            .expect("every source was started");
        assert!(token.is_cancelled(), "source s{i} should have been cancelled");
    }
    // Cancelled sources are not failures.
    assert_eq!(ctx.breakers.snapshot("rss:s9").unwrap().failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn fast_mode_returns_everything_when_limit_is_never_reached() {
    let mock = Arc::new(MockTransport::new());
    mock.respond_after(
        "https://a.test/rss",
        Duration::from_millis(50),
        200,
        &common::rss("a", &[("Only one", 1_760_000_000)]),
    );
    let ctx = common::ctx(
        &mock,
        vec![
            common::source("a", "https://a.test/rss"),
            common::source("dead", "https://dead.test/rss"),
        ],
    );
    let items = ctx
        .news_aggregator()
        .fetch_all(opts(50, true), &CancellationToken::new())
        .await;
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn batch_mode_merges_across_batches() {
    let mock = Arc::new(MockTransport::new());
    let mut sources = Vec::new();
    for i in 0..12i64 {
        let url = format!("https://b{i}.test/rss");
        let own = format!("Batch {i} exclusive");
        mock.respond(
            &url,
            200,
            &common::rss(
                &format!("b{i}"),
                &[
                    (own.as_str(), 1_760_000_000 + i * 60),
                    // Same story everywhere, differently cased.
                    (if i % 2 == 0 { "SHARED WIRE STORY" } else { "shared wire story" }, 1_750_000_000),
                ],
            ),
        );
        sources.push(common::source(&format!("b{i}"), &url));
    }
    let ctx = common::ctx(&mock, sources);

    let all = ctx
        .news_aggregator()
        .fetch_all(opts(200, false), &CancellationToken::new())
        .await;
    assert_eq!(all.len(), 13);
    assert!(all.windows(2).all(|w| w[0].pub_date >= w[1].pub_date));
    assert_eq!(all[0].title, "Batch 11 exclusive");
    assert_eq!(
        all.iter()
            .filter(|i| i.title.eq_ignore_ascii_case("shared wire story"))
            .count(),
        1
    );

    let capped = ctx
        .news_aggregator()
        .fetch_all(opts(5, false), &CancellationToken::new())
        .await;
    assert_eq!(capped.len(), 5);

    let calls_before = mock.calls().len();
    let none = ctx
        .news_aggregator()
        .fetch_all(opts(0, false), &CancellationToken::new())
        .await;
    assert!(none.is_empty());
    assert_eq!(mock.calls().len(), calls_before);
}

#[tokio::test]
async fn open_circuit_skips_the_source() {
    let mock = Arc::new(MockTransport::new());
    mock.respond("https://flaky.test/rss", 502, "bad gateway")
        .respond("https://ok.test/rss", 200, common::RSS_THREE);
    let ctx = common::ctx(
        &mock,
        vec![
            common::source("flaky", "https://flaky.test/rss"),
            common::source("ok", "https://ok.test/rss"),
        ],
    );
    let agg = ctx.news_aggregator();

    for _ in 0..3 {
        let items = agg.fetch_all(FetchOptions::default(), &CancellationToken::new()).await;
        assert_eq!(items.len(), 3);
    }
    assert_eq!(ctx.breakers.state("rss:flaky"), CircuitState::Open);
    assert_eq!(mock.call_count("https://flaky.test/rss"), 3);

    let items = agg.fetch_all(FetchOptions::default(), &CancellationToken::new()).await;
    assert_eq!(items.len(), 3);
    assert_eq!(mock.call_count("https://flaky.test/rss"), 3, "open circuit must not hit the network");
}

#[tokio::test]
async fn backend_mirror_is_preferred_then_local_fallback() {
    let mock = Arc::new(MockTransport::new());
    let config = AppConfig {
        backend: Some(BackendEndpoint {
            base: "https://api.test".into(),
            bearer: None,
        }),
        ..AppConfig::default()
    };
    let ctx = common::ctx_with(
        &mock,
        config,
        common::registry(vec![common::source("a", "https://a.test/rss")]),
    );
    mock.respond("https://a.test/rss", 200, common::RSS_THREE);

    let backend_items = serde_json::json!([{
        "id": "srv-1",
        "title": "Served by the mirror",
        "description": "",
        "fullDescription": "",
        "link": "https://x.test/1",
        "pubDate": "2026-10-19T08:00:00Z",
        "source": "reuters",
        "sourceName": "Reuters",
        "bias": 0,
        "biasLabel": "Center",
        "reliability": "high"
    }]);
    mock.respond(
        "https://api.test/news-aggregator?limit=50",
        200,
        &backend_items.to_string(),
    );

    let items = fetch_all_news(&ctx, opts(50, false), &CancellationToken::new()).await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].title, "Served by the mirror");
    assert_eq!(mock.call_count("https://a.test/rss"), 0);

    mock.respond("https://api.test/news-aggregator?limit=50", 500, "{\"error\":\"down\"}");
    let items = fetch_all_news(&ctx, opts(50, false), &CancellationToken::new()).await;
    assert_eq!(items.len(), 3);
    assert_eq!(mock.call_count("https://a.test/rss"), 1);
}
