// src/ingest/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reliability {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoType {
    Youtube,
    Direct,
}

/// Editorial metadata copied verbatim onto every item of a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiasInfo {
    pub bias: i8, // -3 (far left) ..= 3 (far right)
    pub label: String,
    pub reliability: Reliability,
}

impl BiasInfo {
    pub fn new(bias: i8, reliability: Reliability) -> Self {
        Self {
            bias,
            label: bias_label(bias).to_string(),
            reliability,
        }
    }
}

pub fn bias_label(bias: i8) -> &'static str {
    match bias {
        i8::MIN..=-3 => "Far Left",
        -2 => "Left",
        -1 => "Lean Left",
        0 => "Center",
        1 => "Lean Right",
        2 => "Right",
        3..=i8::MAX => "Far Right",
    }
}

/// Canonical normalized news unit. `id` is unique per fetch cycle only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsItem {
    pub id: String,
    pub title: String,
    pub description: String,
    pub full_description: String,
    pub link: String,
    pub pub_date: DateTime<Utc>,
    pub source: String,
    #[serde(default)]
    pub source_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_type: Option<VideoType>,
    pub bias: i8,
    pub bias_label: String,
    pub reliability: Reliability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub limit: usize,
    pub fast_mode: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            limit: 200,
            fast_mode: false,
        }
    }
}
