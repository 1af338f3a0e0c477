// src/ingest/parser.rs
//! RSS 2.0 / RDF / Atom parsing into `NewsItem`s.
//!
//! The XML is walked with `quick-xml` events into format-neutral `RawEntry`
//! records; media sniffing runs on those records (see `extract`).

use chrono::{DateTime, NaiveDateTime, Utc};
use metrics::{counter, histogram};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;

use crate::error::FetchError;
use crate::ingest::extract;
use crate::ingest::strip_html;
use crate::ingest::types::{BiasInfo, NewsItem};

pub const DEFAULT_ITEM_CAP: usize = 20;
pub const DESCRIPTION_MAX_CHARS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    Rss,
    Atom,
}

impl FeedFormat {
    pub fn detect(raw: &str) -> Self {
        if raw.contains("<entry") {
            FeedFormat::Atom
        } else {
            FeedFormat::Rss
        }
    }

    fn item_tag(self) -> &'static [u8] {
        match self {
            FeedFormat::Rss => b"item",
            FeedFormat::Atom => b"entry",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaRef {
    pub url: String,
    pub mime: Option<String>,
    pub medium: Option<String>,
    pub thumbnail: bool,
}

/// One `<item>`/`<entry>` before normalization. Text fields hold unescaped
/// but otherwise raw content (HTML included).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntry {
    pub title: String,
    pub link: String,
    pub guid: String,
    pub description: String,
    pub content: String,
    pub published: String,
    pub updated: String,
    pub category: Option<String>,
    pub media: Vec<MediaRef>,
    pub enclosures: Vec<MediaRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Title,
    Link,
    Guid,
    Description,
    MediaDescription,
    Content,
    Published,
    Updated,
    Category,
}

fn field_for(name: &[u8], format: FeedFormat) -> Option<Field> {
    match (format, name) {
        (_, b"title") => Some(Field::Title),
        (_, b"media:description") => Some(Field::MediaDescription),
        (_, b"category") => Some(Field::Category),
        (FeedFormat::Rss, b"link") => Some(Field::Link),
        (FeedFormat::Rss, b"guid") => Some(Field::Guid),
        (FeedFormat::Rss, b"description") => Some(Field::Description),
        (FeedFormat::Rss, b"content:encoded") => Some(Field::Content),
        (FeedFormat::Rss, b"pubDate") | (FeedFormat::Rss, b"dc:date") => Some(Field::Published),
        (FeedFormat::Atom, b"summary") => Some(Field::Description),
        (FeedFormat::Atom, b"content") => Some(Field::Content),
        (FeedFormat::Atom, b"published") => Some(Field::Published),
        (FeedFormat::Atom, b"updated") => Some(Field::Updated),
        _ => None,
    }
}

fn append(entry: &mut RawEntry, field: Field, text: &str) {
    let slot = match field {
        Field::Title => &mut entry.title,
        Field::Link => &mut entry.link,
        Field::Guid => &mut entry.guid,
        Field::Description => &mut entry.description,
        Field::Content => &mut entry.content,
        Field::Published => &mut entry.published,
        Field::Updated => &mut entry.updated,
        Field::MediaDescription => {
            // YouTube-style Atom carries the summary only under media:group.
            if entry.description.is_empty() {
                entry.description.push_str(text);
            }
            return;
        }
        Field::Category => {
            if entry.category.is_none() && !text.trim().is_empty() {
                entry.category = Some(text.trim().to_string());
            }
            return;
        }
    };
    slot.push_str(text);
}

fn attr(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.trim().to_string()))
        .filter(|v| !v.is_empty())
}

/// Attribute-carrying elements: media tags, enclosures, Atom links/categories.
fn collect_attrs(entry: &mut RawEntry, e: &BytesStart, format: FeedFormat) {
    match e.name().as_ref() {
        name @ (b"media:content" | b"media:thumbnail") => {
            if let Some(url) = attr(e, b"url") {
                entry.media.push(MediaRef {
                    url,
                    mime: attr(e, b"type"),
                    medium: attr(e, b"medium"),
                    thumbnail: name == b"media:thumbnail",
                });
            }
        }
        b"enclosure" => {
            if let Some(url) = attr(e, b"url") {
                entry.enclosures.push(MediaRef {
                    url,
                    mime: attr(e, b"type"),
                    ..MediaRef::default()
                });
            }
        }
        b"link" if format == FeedFormat::Atom => {
            let Some(href) = attr(e, b"href") else { return };
            match attr(e, b"rel").as_deref().unwrap_or("alternate") {
                "alternate" if entry.link.is_empty() => entry.link = href,
                "enclosure" => entry.enclosures.push(MediaRef {
                    url: href,
                    mime: attr(e, b"type"),
                    ..MediaRef::default()
                }),
                _ => {}
            }
        }
        b"category" if format == FeedFormat::Atom => {
            if entry.category.is_none() {
                entry.category = attr(e, b"term");
            }
        }
        _ => {}
    }
}

fn looks_like_feed(raw: &str) -> bool {
    ["<rss", "<feed", "<rdf:RDF", "<channel", "<item", "<entry"]
        .iter()
        .any(|marker| raw.contains(marker))
}

/// Walk the document and return every item/entry in feed order.
pub fn read_entries(raw: &str) -> Result<Vec<RawEntry>, FetchError> {
    if !looks_like_feed(raw) {
        return Err(FetchError::Parse("not an RSS/Atom document".into()));
    }
    let format = FeedFormat::detect(raw);
    let item_tag = format.item_tag();

    let mut reader = Reader::from_str(raw);
    let cfg = reader.config_mut();
    cfg.trim_text(true);
    // Feeds routinely embed unclosed HTML (<br>, <p>) outside CDATA.
    cfg.check_end_names = false;

    let mut entries = Vec::new();
    let mut current: Option<RawEntry> = None;
    let mut field: Option<Field> = None;
    // The open field closes only on its own end tag; `nested` counts
    // same-named descendants so stray HTML inside it cannot end it early.
    let mut field_tag: Vec<u8> = Vec::new();
    let mut nested = 0usize;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if current.is_none() {
                    if e.name().as_ref() == item_tag {
                        current = Some(RawEntry::default());
                    }
                    continue;
                }
                if let (Some(entry), Some(f)) = (current.as_mut(), field) {
                    if e.name().as_ref() == field_tag.as_slice() {
                        nested += 1;
                    }
                    append(entry, f, " ");
                    continue;
                }
                if let Some(entry) = current.as_mut() {
                    collect_attrs(entry, &e, format);
                    field = field_for(e.name().as_ref(), format);
                    field_tag.clear();
                    field_tag.extend_from_slice(e.name().as_ref());
                    nested = 0;
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(entry) = current.as_mut() {
                    match field {
                        // <br/> and friends inside markup still break words.
                        Some(f) => append(entry, f, " "),
                        None => collect_attrs(entry, &e, format),
                    }
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name();
                if let (Some(f), false) = (field, name.as_ref() == item_tag) {
                    if name.as_ref() == field_tag.as_slice() {
                        if nested > 0 {
                            nested -= 1;
                        } else {
                            field = None;
                        }
                    } else if let Some(entry) = current.as_mut() {
                        append(entry, f, " ");
                    }
                    continue;
                }
                if name.as_ref() == item_tag {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                    field = None;
                    nested = 0;
                }
            }
            Ok(Event::Text(t)) => {
                if let (Some(entry), Some(f)) = (current.as_mut(), field) {
                    let text = t.unescape().map(|c| c.into_owned()).unwrap_or_else(|_| {
                        html_escape::decode_html_entities(&String::from_utf8_lossy(&t))
                            .into_owned()
                    });
                    append(entry, f, &text);
                }
            }
            Ok(Event::CData(c)) => {
                if let (Some(entry), Some(f)) = (current.as_mut(), field) {
                    append(entry, f, &String::from_utf8_lossy(&c));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(FetchError::Parse(format!(
                    "xml error at byte {}: {e}",
                    reader.buffer_position()
                )))
            }
            _ => {}
        }
    }

    Ok(entries)
}

/// RFC 2822 (RSS) and RFC 3339 (Atom) first, then chrono's laxer parsers.
pub fn parse_feed_date(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    let strict = OffsetDateTime::parse(s, &Rfc2822)
        .or_else(|_| OffsetDateTime::parse(s, &Rfc3339))
        .ok()
        .and_then(|dt| DateTime::from_timestamp(dt.unix_timestamp(), dt.nanosecond()));
    if strict.is_some() {
        return strict;
    }
    DateTime::parse_from_rfc2822(s)
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                .ok()
                .map(|n| n.and_utc())
        })
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    s.chars().take(max).collect()
}

#[derive(Debug, Clone)]
pub struct FeedParser {
    max_items: Option<usize>,
    fetched_at: DateTime<Utc>,
}

impl Default for FeedParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedParser {
    pub fn new() -> Self {
        Self {
            max_items: Some(DEFAULT_ITEM_CAP),
            fetched_at: Utc::now(),
        }
    }

    /// No per-feed cap; the batch aggregator relies on its global limit.
    pub fn uncapped() -> Self {
        Self {
            max_items: None,
            ..Self::new()
        }
    }

    /// Pin the fetch time used for ids and missing dates.
    pub fn at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = fetched_at;
        self
    }

    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    pub fn parse(
        &self,
        raw: &str,
        source: &str,
        bias: &BiasInfo,
    ) -> Result<Vec<NewsItem>, FetchError> {
        let t0 = std::time::Instant::now();
        let entries = match read_entries(raw) {
            Ok(v) => v,
            Err(e) => {
                counter!("feed_parse_errors_total").increment(1);
                return Err(e);
            }
        };

        let cap = self.max_items.unwrap_or(usize::MAX);
        let out: Vec<NewsItem> = entries
            .into_iter()
            .enumerate()
            .filter_map(|(idx, entry)| self.normalize(idx, entry, source, bias))
            .take(cap)
            .collect();

        histogram!("feed_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        counter!("feed_items_parsed_total").increment(out.len() as u64);
        Ok(out)
    }

    fn normalize(
        &self,
        idx: usize,
        entry: RawEntry,
        source: &str,
        bias: &BiasInfo,
    ) -> Option<NewsItem> {
        let title = strip_html(&entry.title);
        if title.is_empty() {
            return None;
        }

        let pub_date = parse_feed_date(&entry.published)
            .or_else(|| parse_feed_date(&entry.updated))
            .unwrap_or(self.fetched_at);

        let summary_raw = if entry.description.trim().is_empty() {
            &entry.content
        } else {
            &entry.description
        };
        let full_raw = if entry.content.trim().is_empty() {
            &entry.description
        } else {
            &entry.content
        };
        let full_description = strip_html(full_raw);
        let description = truncate_chars(&strip_html(summary_raw), DESCRIPTION_MAX_CHARS);

        let link = match entry.link.trim() {
            "" if entry.guid.trim().starts_with("http") => entry.guid.trim().to_string(),
            l => l.to_string(),
        };

        let image_url = extract::first_image(&entry);
        let (video_url, video_type) = match extract::first_video(&entry) {
            Some((url, kind)) => (Some(url), Some(kind)),
            None => (None, None),
        };

        Some(NewsItem {
            id: format!("{source}-{idx}-{}", self.fetched_at.timestamp_millis()),
            title,
            description,
            full_description,
            link,
            pub_date,
            source: source.to_string(),
            source_name: source.to_string(),
            category: entry.category,
            image_url,
            video_url,
            video_type,
            bias: bias.bias,
            bias_label: bias.label.clone(),
            reliability: bias.reliability,
        })
    }
}
