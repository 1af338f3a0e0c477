// src/ingest/extract.rs
//! Best-effort media sniffing. Each strategy looks at one kind of evidence
//! and returns `None` when it has nothing; the first hit in priority order
//! wins. URLs are not checked for reachability.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::ingest::parser::{MediaRef, RawEntry};
use crate::ingest::types::VideoType;

pub type ImageStrategy = fn(&RawEntry) -> Option<String>;
pub type VideoStrategy = fn(&RawEntry) -> Option<(String, VideoType)>;

/// Priority: media namespace, enclosure, inline `<img>`.
pub const IMAGE_STRATEGIES: &[ImageStrategy] = &[media_image, enclosure_image, inline_image];

/// Priority: YouTube anywhere, media namespace video, video enclosure.
pub const VIDEO_STRATEGIES: &[VideoStrategy] = &[youtube_video, media_video, enclosure_video];

static RE_IMAGE_EXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(jpe?g|png|gif|webp|avif)(\?|#|$)").expect("image ext regex"));
static RE_VIDEO_EXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(mp4|webm|m3u8|mov)(\?|#|$)").expect("video ext regex"));
static RE_IMG_SRC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<img\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#).expect("img src regex")
});
static RE_YOUTUBE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:youtube(?:-nocookie)?\.com/(?:watch\?(?:[^\s<>]*?&(?:amp;)?)?v=|embed/|shorts/|v/)|youtu\.be/)([A-Za-z0-9_-]{11})")
        .expect("youtube regex")
});

pub fn first_image(entry: &RawEntry) -> Option<String> {
    IMAGE_STRATEGIES.iter().find_map(|s| s(entry))
}

pub fn first_video(entry: &RawEntry) -> Option<(String, VideoType)> {
    VIDEO_STRATEGIES.iter().find_map(|s| s(entry))
}

fn clean_url(raw: &str) -> Option<String> {
    let u = raw.trim().replace("&amp;", "&");
    if u.is_empty() {
        return None;
    }
    if let Some(rest) = u.strip_prefix("//") {
        return Some(format!("https://{rest}"));
    }
    Some(u)
}

fn mime_is(m: &MediaRef, prefix: &str) -> bool {
    m.mime.as_deref().is_some_and(|t| t.starts_with(prefix))
        || m.medium.as_deref() == Some(prefix.trim_end_matches('/'))
}

pub fn media_image(entry: &RawEntry) -> Option<String> {
    entry
        .media
        .iter()
        .find(|m| {
            mime_is(m, "image/")
                || (m.thumbnail && !mime_is(m, "video/"))
                || (m.mime.is_none() && m.medium.is_none() && RE_IMAGE_EXT.is_match(&m.url))
        })
        .and_then(|m| clean_url(&m.url))
}

pub fn enclosure_image(entry: &RawEntry) -> Option<String> {
    entry
        .enclosures
        .iter()
        .find(|m| mime_is(m, "image/") || RE_IMAGE_EXT.is_match(&m.url))
        .and_then(|m| clean_url(&m.url))
}

pub fn inline_image(entry: &RawEntry) -> Option<String> {
    [&entry.description, &entry.content]
        .into_iter()
        .find_map(|html| RE_IMG_SRC.captures(html))
        .and_then(|c| clean_url(&c[1]))
}

pub fn youtube_video(entry: &RawEntry) -> Option<(String, VideoType)> {
    let urls = entry
        .media
        .iter()
        .chain(entry.enclosures.iter())
        .map(|m| m.url.as_str());
    std::iter::once(entry.link.as_str())
        .chain(urls)
        .chain([entry.description.as_str(), entry.content.as_str()])
        .find_map(|hay| RE_YOUTUBE.captures(hay))
        .map(|c| {
            (
                format!("https://www.youtube.com/embed/{}", &c[1]),
                VideoType::Youtube,
            )
        })
}

pub fn media_video(entry: &RawEntry) -> Option<(String, VideoType)> {
    entry
        .media
        .iter()
        .find(|m| mime_is(m, "video/"))
        .and_then(|m| clean_url(&m.url))
        .map(|u| (u, VideoType::Direct))
}

pub fn enclosure_video(entry: &RawEntry) -> Option<(String, VideoType)> {
    entry
        .enclosures
        .iter()
        .find(|m| mime_is(m, "video/") || RE_VIDEO_EXT.is_match(&m.url))
        .and_then(|m| clean_url(&m.url))
        .map(|u| (u, VideoType::Direct))
}
