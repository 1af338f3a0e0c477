// tests/mirror_api.rs
//
// HTTP-level tests for the backend mirror Router without opening sockets.
// We exercise the router directly via tower::ServiceExt::oneshot.
//
// Covered:
// - GET /health
// - /news-aggregator cache HIT/MISS across the TTL, limit slicing
// - /market-data kind validation, upstream failure, happy path
// - OPTIONS -> 204 and the CORS allow-list, GET/OPTIONS only
// - /api/news envelope (fresh, cached, stale while refreshing)
// - /twitter-intel through a social mirror

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{self, Body},
    Router,
};
use http::{Request, StatusCode};
use serde_json::Value as Json;
use tower::ServiceExt as _; // for `oneshot`

use situation_monitor::config::AppConfig;
use situation_monitor::gateway::MockTransport;
use situation_monitor::ingest::config::{SocialAccount, SourceRegistry};
use situation_monitor::ingest::providers::markets::{chart_url, MarketKind};
use situation_monitor::{router, MirrorState};

const BODY_LIMIT: usize = 1024 * 1024;
const FEED: &str = "https://wire.test/rss";

fn news_state(mock: &Arc<MockTransport>) -> MirrorState {
    mock.respond(FEED, 200, common::RSS_THREE);
    MirrorState::new(common::ctx(mock, vec![common::source("wire", FEED)]))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .expect("build GET")
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Option<String>, Json) {
    let resp = app.clone().oneshot(req).await.expect("oneshot");
    let status = resp.status();
    let cache = resp
        .headers()
        .get("x-cache")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = body::to_bytes(resp.into_body(), BODY_LIMIT)
        .await
        .expect("read body");
    let json = if bytes.is_empty() {
        Json::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Json::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, cache, json)
}

#[tokio::test]
async fn health_returns_ok() {
    let mock = Arc::new(MockTransport::new());
    let app = router(news_state(&mock));
    let (status, _, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Json::String("ok".into()));
}

#[tokio::test(start_paused = true)]
async fn news_cache_serves_hits_until_ttl_then_refetches() {
    let mock = Arc::new(MockTransport::new());
    let app = router(news_state(&mock));

    let (status, cache, first) = send(&app, get("/news-aggregator")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache.as_deref(), Some("MISS"));
    assert_eq!(first.as_array().unwrap().len(), 3);
    assert_eq!(mock.call_count(FEED), 1);

    tokio::time::advance(Duration::from_secs(30)).await;
    let (_, cache, second) = send(&app, get("/news-aggregator")).await;
    assert_eq!(cache.as_deref(), Some("HIT"));
    assert_eq!(second, first);
    assert_eq!(mock.call_count(FEED), 1, "hit must not touch upstream");

    tokio::time::advance(Duration::from_secs(20)).await;
    let (_, cache, _) = send(&app, get("/news-aggregator")).await;
    assert_eq!(cache.as_deref(), Some("MISS"));
    assert_eq!(mock.call_count(FEED), 2);
}

#[tokio::test]
async fn news_limit_slices_the_cached_list() {
    let mock = Arc::new(MockTransport::new());
    let app = router(news_state(&mock));

    let (_, _, all) = send(&app, get("/news-aggregator")).await;
    let (_, cache, two) = send(&app, get("/news-aggregator?limit=2")).await;
    assert_eq!(cache.as_deref(), Some("HIT"));
    let two = two.as_array().unwrap();
    assert_eq!(two.len(), 2);
    assert_eq!(two[0]["title"], all[0]["title"]);

    let (_, _, junk) = send(&app, get("/news-aggregator?limit=lots")).await;
    assert_eq!(junk.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn market_data_rejects_unknown_kind() {
    let mock = Arc::new(MockTransport::new());
    let app = router(news_state(&mock));
    let (status, _, body) = send(&app, get("/market-data?kind=bonds")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid kind"));
    assert!(mock.calls().iter().all(|u| !u.contains("yahoo")));
}

#[tokio::test]
async fn market_data_total_upstream_failure_is_500() {
    let mock = Arc::new(MockTransport::new());
    let app = router(news_state(&mock));
    let (status, _, body) = send(&app, get("/market-data?kind=sectors")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.get("error").is_some());
}

#[tokio::test]
async fn market_data_defaults_to_indices_and_caches_per_kind() {
    let mock = Arc::new(MockTransport::new());
    for (symbol, _) in MarketKind::Indices.symbols() {
        mock.respond(&chart_url(symbol), 200, common::YAHOO_CHART);
    }
    let app = router(news_state(&mock));

    let (status, cache, body) = send(&app, get("/market-data")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache.as_deref(), Some("MISS"));
    let quotes = body.as_array().unwrap();
    assert_eq!(quotes.len(), MarketKind::Indices.symbols().len());
    assert_eq!(quotes[0]["symbol"], "^GSPC");
    assert_eq!(quotes[0]["price"], 5850.25);
    assert_eq!(quotes[0]["change"], 50.25);

    let (_, cache, _) = send(&app, get("/market-data?kind=indices")).await;
    assert_eq!(cache.as_deref(), Some("HIT"));
}

#[tokio::test]
async fn options_is_204_with_or_without_preflight_headers() {
    let mock = Arc::new(MockTransport::new());
    let app = router(news_state(&mock));

    for uri in ["/news-aggregator", "/market-data", "/twitter-intel", "/api/news"] {
        let bare = Request::builder()
            .method("OPTIONS")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&app, bare).await;
        assert_eq!(status, StatusCode::NO_CONTENT, "bare OPTIONS {uri}");

        let preflight = Request::builder()
            .method("OPTIONS")
            .uri(uri)
            .header("origin", "http://localhost:5173")
            .header("access-control-request-method", "GET")
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(preflight).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT, "preflight {uri}");
        assert_eq!(
            resp.headers()["access-control-allow-origin"],
            "http://localhost:5173"
        );
    }
    assert!(mock.calls().is_empty(), "OPTIONS never fetches");
}

#[tokio::test]
async fn preflight_advertises_read_only_methods() {
    let mock = Arc::new(MockTransport::new());
    let app = router(news_state(&mock));

    let preflight = Request::builder()
        .method("OPTIONS")
        .uri("/news-aggregator")
        .header("origin", "http://localhost:5173")
        .header("access-control-request-method", "POST")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(preflight).await.unwrap();
    let methods = resp.headers()["access-control-allow-methods"]
        .to_str()
        .unwrap()
        .to_ascii_uppercase();
    assert!(methods.contains("GET"));
    assert!(methods.contains("OPTIONS"));
    assert!(!methods.contains("POST"), "no route accepts writes: {methods}");
}

#[tokio::test]
async fn cors_echoes_only_allowed_origins() {
    let mock = Arc::new(MockTransport::new());
    mock.respond(FEED, 200, common::RSS_THREE);
    let config = AppConfig {
        allowed_origins: vec!["https://dash.example.test".into()],
        ..AppConfig::default()
    };
    let ctx = common::ctx_with(
        &mock,
        config,
        common::registry(vec![common::source("wire", FEED)]),
    );
    let app = router(MirrorState::new(ctx));

    let allowed = Request::builder()
        .uri("/news-aggregator")
        .header("origin", "https://dash.example.test")
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(allowed).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()["access-control-allow-origin"],
        "https://dash.example.test"
    );

    let denied = Request::builder()
        .uri("/news-aggregator")
        .header("origin", "https://evil.example.test")
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(denied).await.unwrap();
    assert!(resp.headers().get("access-control-allow-origin").is_none());
}

#[tokio::test(start_paused = true)]
async fn legacy_envelope_fresh_cached_then_stale_while_refreshing() {
    let mock = Arc::new(MockTransport::new());
    let state = news_state(&mock);
    let app = router(state.clone());

    let (status, _, fresh) = send(&app, get("/api/news")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fresh["success"], true);
    assert_eq!(fresh["cached"], false);
    assert_eq!(fresh["count"], 3);
    assert!(fresh.get("cacheAge").is_none());

    tokio::time::advance(Duration::from_secs(10)).await;
    let (_, _, cached) = send(&app, get("/api/news?limit=1")).await;
    assert_eq!(cached["cached"], true);
    assert_eq!(cached["cacheAge"], 10_000);
    assert_eq!(cached["count"], 1);
    assert!(cached.get("stale").is_none());

    tokio::time::advance(Duration::from_secs(30)).await;
    {
        let _held = state
            .caches
            .legacy_refreshing
            .try_begin()
            .expect("flag is free");
        let (_, _, stale) = send(&app, get("/api/news")).await;
        assert_eq!(stale["cached"], true);
        assert_eq!(stale["stale"], true);
        assert_eq!(stale["cacheAge"], 40_000);
        assert_eq!(mock.call_count(FEED), 1);
    }

    let (_, _, refreshed) = send(&app, get("/api/news")).await;
    assert_eq!(refreshed["cached"], false);
    assert_eq!(mock.call_count(FEED), 2);
    assert!(!state.caches.legacy_refreshing.is_refreshing());
}

#[tokio::test]
async fn twitter_intel_reads_accounts_through_mirrors() {
    let mock = Arc::new(MockTransport::new());
    mock.respond(
        "https://nitter.example.test/IntelCrab/rss",
        200,
        common::NITTER_FEED,
    );
    let sources = SourceRegistry {
        social: vec![SocialAccount {
            handle: "IntelCrab".into(),
            name: "Intel Crab".into(),
            category: Some("osint".into()),
            mirrors: vec![],
        }],
        social_mirrors: vec!["https://nitter.example.test".into()],
        ..SourceRegistry::default()
    };
    let app = router(MirrorState::new(common::ctx_with(
        &mock,
        AppConfig::default(),
        sources,
    )));

    let (status, cache, body) = send(&app, get("/twitter-intel")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache.as_deref(), Some("MISS"));
    let tweets = body.as_array().unwrap();
    assert_eq!(tweets.len(), 2);
    assert_eq!(tweets[0]["handle"], "IntelCrab");
    assert_eq!(tweets[0]["category"], "osint");
    assert!(tweets[0]["text"]
        .as_str()
        .unwrap()
        .starts_with("Reports of explosions near the port"));

    let (_, cache, one) = send(&app, get("/twitter-intel?limit=1")).await;
    assert_eq!(cache.as_deref(), Some("HIT"));
    assert_eq!(one.as_array().unwrap().len(), 1);
}
