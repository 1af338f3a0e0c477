// src/ingest/config.rs
//! Static source table: news feeds with editorial metadata and OSINT social
//! accounts with their mirror endpoints. Loaded once, validated at load time.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::ingest::types::{BiasInfo, Reliability};

const ENV_PATH: &str = "SOURCES_CONFIG_PATH";
const BUILTIN: &str = include_str!("../../config/sources.toml");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsSource {
    pub id: String,
    pub name: String,
    pub url: String,
    pub bias: i8,
    pub reliability: Reliability,
    #[serde(default)]
    pub category: Option<String>,
}

impl NewsSource {
    pub fn bias_info(&self) -> BiasInfo {
        BiasInfo::new(self.bias, self.reliability)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocialAccount {
    pub handle: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
    /// Overrides the registry-wide mirror list for this account.
    #[serde(default)]
    pub mirrors: Vec<String>,
}

impl SocialAccount {
    /// Feed URLs in try-order: `{mirror}/{handle}/rss`.
    pub fn feed_urls(&self, default_mirrors: &[String]) -> Vec<String> {
        let mirrors = if self.mirrors.is_empty() {
            default_mirrors
        } else {
            &self.mirrors
        };
        mirrors
            .iter()
            .map(|m| format!("{}/{}/rss", m.trim_end_matches('/'), self.handle))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub news: Vec<NewsSource>,
    #[serde(default)]
    pub social: Vec<SocialAccount>,
    #[serde(default)]
    pub social_mirrors: Vec<String>,
}

impl SourceRegistry {
    /// The table compiled into the binary.
    pub fn builtin() -> Result<Self> {
        parse_registry(BUILTIN, "toml").context("parsing built-in config/sources.toml")
    }

    /// Load from an explicit path. Supports TOML or JSON formats.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading sources from {}", path.display()))?;
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        parse_registry(&content, ext.as_str())
            .with_context(|| format!("parsing sources from {}", path.display()))
    }

    /// $SOURCES_CONFIG_PATH if set, the built-in table otherwise.
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_PATH} points to non-existent path"));
            }
            return Self::load_from(&pb);
        }
        Self::builtin()
    }

    pub fn news_source(&self, id: &str) -> Option<&NewsSource> {
        self.news.iter().find(|s| s.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for s in &self.news {
            if s.id.trim().is_empty() {
                bail!("news source with empty id ({})", s.name);
            }
            if !ids.insert(s.id.as_str()) {
                bail!("duplicate news source id '{}'", s.id);
            }
            if !(-3..=3).contains(&s.bias) {
                bail!("source '{}' has bias {} outside -3..=3", s.id, s.bias);
            }
            check_http_url(&s.url).with_context(|| format!("source '{}'", s.id))?;
        }

        let mut handles = HashSet::new();
        for a in &self.social {
            if a.handle.trim().is_empty() {
                bail!("social account with empty handle ({})", a.name);
            }
            if !handles.insert(a.handle.to_ascii_lowercase()) {
                bail!("duplicate social handle '{}'", a.handle);
            }
            if a.mirrors.is_empty() && self.social_mirrors.is_empty() {
                bail!("social account '{}' has no mirror endpoints", a.handle);
            }
            for m in &a.mirrors {
                check_http_url(m).with_context(|| format!("mirror for '{}'", a.handle))?;
            }
        }
        for m in &self.social_mirrors {
            check_http_url(m).context("social_mirrors")?;
        }
        Ok(())
    }
}

fn check_http_url(raw: &str) -> Result<()> {
    let u = url::Url::parse(raw).with_context(|| format!("invalid url '{raw}'"))?;
    match u.scheme() {
        "http" | "https" => Ok(()),
        other => Err(anyhow!("unsupported scheme '{other}' in '{raw}'")),
    }
}

fn parse_registry(s: &str, hint_ext: &str) -> Result<SourceRegistry> {
    let parsed = if hint_ext == "json" || s.trim_start().starts_with('{') {
        serde_json::from_str::<SourceRegistry>(s).map_err(anyhow::Error::from)
    } else {
        toml::from_str::<SourceRegistry>(s).map_err(anyhow::Error::from)
    }?;
    parsed.validate()?;
    Ok(parsed)
}
