// src/gateway.rs
//! Proxy gateway: direct fetch first, then an ordered chain of public CORS
//! proxy mirrors. Every failure except cancellation degrades to "no data".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Method;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Cancelled, FetchError};

pub const FEED_ACCEPT: &str = "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.9, application/json;q=0.8, */*;q=0.5";

pub const DEFAULT_MIRRORS: &[&str] = &[
    "https://api.allorigins.win/raw?url=",
    "https://corsproxy.io/?url=",
    "https://api.codetabs.com/v1/proxy?quest=",
];

/// Same set `encodeURIComponent` leaves alone.
pub(crate) const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post_json(url: impl Into<String>, body: &serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: Some(body.to_string()),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Which hop produced a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    Mirror(String),
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
    pub route: Route,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Network seam. Implementations return a response for any HTTP status and
/// reserve `Err` for transport failures; they must honour `cancel`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(
        &self,
        req: &HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, FetchError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent("situation-monitor/0.1 (+live-data aggregation)")
            .connect_timeout(Duration::from_secs(4))
            .timeout(timeout)
            .gzip(true)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(
        &self,
        req: &HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, FetchError> {
        let mut rb = self.client.request(req.method.clone(), &req.url);
        for (k, v) in &req.headers {
            rb = rb.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &req.body {
            rb = rb.body(body.clone());
        }

        let send = async {
            let resp = rb.send().await?;
            let status = resp.status().as_u16();
            let body = resp.text().await?;
            Ok::<_, FetchError>(RawResponse {
                url: req.url.clone(),
                status,
                body,
                route: Route::Direct,
            })
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            res = send => res,
        }
    }
}

pub struct ProxyGateway {
    transport: Arc<dyn HttpTransport>,
    mirrors: Vec<String>,
}

impl ProxyGateway {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self::with_mirrors(
            transport,
            DEFAULT_MIRRORS.iter().map(|m| m.to_string()).collect(),
        )
    }

    pub fn with_mirrors(transport: Arc<dyn HttpTransport>, mirrors: Vec<String>) -> Self {
        Self { transport, mirrors }
    }

    /// Server-side contexts have no CORS restriction, so no mirrors.
    pub fn direct_only(transport: Arc<dyn HttpTransport>) -> Self {
        Self::with_mirrors(transport, Vec::new())
    }

    pub fn mirrors(&self) -> &[String] {
        &self.mirrors
    }

    pub fn mirror_url(base: &str, target: &str) -> String {
        format!("{base}{}", utf8_percent_encode(target, URI_COMPONENT))
    }

    /// Direct attempt, then each mirror in order. `Ok(None)` means every hop
    /// failed and the caller should carry on without data.
    pub async fn fetch_through_gateway(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<RawResponse>, Cancelled> {
        if let Some(resp) = self.attempt(url.to_string(), Route::Direct, cancel).await? {
            return Ok(Some(resp));
        }

        for base in &self.mirrors {
            let proxied = Self::mirror_url(base, url);
            if let Some(resp) = self
                .attempt(proxied, Route::Mirror(base.clone()), cancel)
                .await?
            {
                counter!("gateway_mirror_fallbacks_total").increment(1);
                return Ok(Some(resp));
            }
        }

        counter!("gateway_unreachable_total").increment(1);
        debug!(%url, mirrors = self.mirrors.len(), "gateway exhausted all routes");
        Ok(None)
    }

    async fn attempt(
        &self,
        url: String,
        route: Route,
        cancel: &CancellationToken,
    ) -> Result<Option<RawResponse>, Cancelled> {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }
        let req = HttpRequest::get(url).header("Accept", FEED_ACCEPT);
        match self.transport.execute(&req, cancel).await {
            Ok(mut resp) if resp.is_success() => {
                resp.route = route;
                Ok(Some(resp))
            }
            Ok(resp) => {
                debug!(url = %req.url, status = resp.status, ?route, "gateway hop rejected");
                Ok(None)
            }
            Err(FetchError::Cancelled) => Err(Cancelled),
            Err(e) => {
                if cancel.is_cancelled() {
                    return Err(Cancelled);
                }
                debug!(url = %req.url, error = %e, ?route, "gateway hop failed");
                Ok(None)
            }
        }
    }

    /// Single direct GET without mirrors; non-2xx is an error.
    pub async fn fetch_direct(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, FetchError> {
        self.send(HttpRequest::get(url).header("Accept", FEED_ACCEPT), cancel)
            .await
    }

    pub async fn send(
        &self,
        req: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let resp = self.transport.execute(&req, cancel).await?;
        if !resp.is_success() {
            return Err(FetchError::Status {
                status: resp.status,
                url: req.url,
            });
        }
        Ok(resp)
    }
}

// --- Test helper ---

#[derive(Debug, Clone)]
enum MockReply {
    Respond { status: u16, body: String },
    NetworkError,
}

#[derive(Debug, Clone)]
struct MockRoute {
    delay: Duration,
    reply: MockReply,
}

/// Scripted transport keyed by exact URL. Unknown URLs fail with a network
/// error. Delays honour cancellation, and every call's token is kept so tests
/// can check whether a request was cancelled.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, MockRoute>>,
    calls: Mutex<Vec<(String, CancellationToken)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) -> &Self {
        self.respond_after(url, Duration::ZERO, status, body)
    }

    pub fn respond_after(&self, url: &str, delay: Duration, status: u16, body: &str) -> &Self {
        self.routes.lock().insert(
            url.to_string(),
            MockRoute {
                delay,
                reply: MockReply::Respond {
                    status,
                    body: body.to_string(),
                },
            },
        );
        self
    }

    pub fn fail(&self, url: &str) -> &Self {
        self.routes.lock().insert(
            url.to_string(),
            MockRoute {
                delay: Duration::ZERO,
                reply: MockReply::NetworkError,
            },
        );
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(u, _)| u.clone()).collect()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.calls.lock().iter().filter(|(u, _)| u == url).count()
    }

    /// Token handed to the most recent call for `url`.
    pub fn token_for(&self, url: &str) -> Option<CancellationToken> {
        self.calls
            .lock()
            .iter()
            .rev()
            .find(|(u, _)| u == url)
            .map(|(_, t)| t.clone())
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(
        &self,
        req: &HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<RawResponse, FetchError> {
        self.calls.lock().push((req.url.clone(), cancel.clone()));
        let route = self.routes.lock().get(&req.url).cloned();
        let Some(route) = route else {
            return Err(FetchError::Network(format!("no route for {}", req.url)));
        };

        if !route.delay.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(route.delay) => {}
            }
        }

        match route.reply {
            MockReply::Respond { status, body } => Ok(RawResponse {
                url: req.url.clone(),
                status,
                body,
                route: Route::Direct,
            }),
            MockReply::NetworkError => Err(FetchError::Network("connection reset".into())),
        }
    }
}
