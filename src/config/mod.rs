// src/config/mod.rs
//! Environment-driven settings. Every variable is read bare first and then
//! with the `VITE_` prefix the dashboard build uses. Absent values disable the
//! optional feature they gate rather than failing startup.

use std::time::Duration;

pub const DEFAULT_ALLOWED_ORIGINS: &[&str] = &[
    "https://situation-monitor.vercel.app",
    "http://localhost:5173",
];

const DEFAULT_BATCH_SIZE: usize = 8;
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Where the pre-merged mirror endpoints live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendEndpoint {
    pub base: String,
    pub bearer: Option<String>,
}

impl BackendEndpoint {
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcledCredentials {
    pub key: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub allowed_origins: Vec<String>,
    pub backend: Option<BackendEndpoint>,
    pub acled: Option<AcledCredentials>,
    pub news_batch_size: usize,
    pub http_timeout: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            allowed_origins: DEFAULT_ALLOWED_ORIGINS.iter().map(|s| s.to_string()).collect(),
            backend: None,
            acled: None,
            news_batch_size: DEFAULT_BATCH_SIZE,
            http_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| {
            get(name)
                .or_else(|| get(&format!("VITE_{name}")))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let allowed_origins = var("ALLOWED_ORIGINS")
            .map(|raw| parse_origins(&raw))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| Self::default().allowed_origins);

        // An explicit API_URL wins over a Supabase functions host.
        let backend = match (var("API_URL"), var("SUPABASE_URL")) {
            (Some(base), _) => Some(BackendEndpoint { base, bearer: None }),
            (None, Some(supabase)) => Some(BackendEndpoint {
                base: format!("{}/functions/v1", supabase.trim_end_matches('/')),
                bearer: var("SUPABASE_ANON_KEY"),
            }),
            (None, None) => None,
        };

        let acled = match (var("ACLED_API_KEY"), var("ACLED_EMAIL")) {
            (Some(key), Some(email)) => Some(AcledCredentials { key, email }),
            _ => None,
        };

        let news_batch_size = var("NEWS_BATCH_SIZE")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_BATCH_SIZE)
            .clamp(5, 10);

        let http_timeout = var("HTTP_TIMEOUT_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS));

        Self {
            allowed_origins,
            backend,
            acled,
            news_batch_size,
            http_timeout,
        }
    }
}

pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg(pairs: &[(&str, &str)]) -> AppConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = cfg(&[]);
        assert_eq!(c, AppConfig::default());
        assert_eq!(c.allowed_origins.len(), 2);
    }

    #[test]
    fn origins_are_trimmed_and_split() {
        let c = cfg(&[("ALLOWED_ORIGINS", " https://a.test/ , ,http://b.test ")]);
        assert_eq!(c.allowed_origins, vec!["https://a.test", "http://b.test"]);
    }

    #[test]
    fn vite_prefixed_names_are_accepted() {
        let c = cfg(&[
            ("VITE_SUPABASE_URL", "https://proj.supabase.test/"),
            ("VITE_SUPABASE_ANON_KEY", "anon"),
        ]);
        let b = c.backend.unwrap();
        assert_eq!(b.url("news-aggregator"), "https://proj.supabase.test/functions/v1/news-aggregator");
        assert_eq!(b.bearer.as_deref(), Some("anon"));
    }

    #[test]
    fn api_url_beats_supabase_and_acled_needs_both_parts() {
        let c = cfg(&[
            ("API_URL", "https://api.test"),
            ("SUPABASE_URL", "https://proj.supabase.test"),
            ("ACLED_API_KEY", "k"),
        ]);
        assert_eq!(c.backend.unwrap().base, "https://api.test");
        assert!(c.acled.is_none());
    }

    #[test]
    fn batch_size_is_clamped() {
        assert_eq!(cfg(&[("NEWS_BATCH_SIZE", "50")]).news_batch_size, 10);
        assert_eq!(cfg(&[("NEWS_BATCH_SIZE", "1")]).news_batch_size, 5);
        assert_eq!(cfg(&[("NEWS_BATCH_SIZE", "x")]).news_batch_size, 8);
    }
}
