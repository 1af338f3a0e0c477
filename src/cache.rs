// src/cache.rs
//! Process-local response caches for the mirror endpoints.
//!
//! Each slot is keyed by time only: every request inside the TTL window gets
//! the same payload. There is no single-flight; concurrent misses each go
//! upstream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::ingest::providers::markets::{MarketKind, Quote};
use crate::ingest::providers::social::Tweet;
use crate::ingest::types::NewsItem;

pub const NEWS_TTL: Duration = Duration::from_secs(45);
pub const MARKET_TTL: Duration = Duration::from_secs(25);
pub const TWITTER_TTL: Duration = Duration::from_secs(25);
pub const LEGACY_NEWS_TTL: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct TtlSlot<T> {
    ttl: Duration,
    slot: Mutex<Option<(Instant, T)>>,
}

impl<T: Clone> TtlSlot<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Value stored less than `ttl` ago.
    pub fn get_fresh(&self) -> Option<T> {
        let slot = self.slot.lock();
        match slot.as_ref() {
            Some((at, v)) if at.elapsed() < self.ttl => Some(v.clone()),
            _ => None,
        }
    }

    /// Whatever is stored, expired or not, with its age.
    pub fn get_any(&self) -> Option<(T, Duration)> {
        self.slot
            .lock()
            .as_ref()
            .map(|(at, v)| (v.clone(), at.elapsed()))
    }

    pub fn put(&self, value: T) {
        *self.slot.lock() = Some((Instant::now(), value));
    }

    pub fn reset(&self) {
        *self.slot.lock() = None;
    }
}

/// One slot per market kind, so kinds never overwrite each other.
#[derive(Debug)]
pub struct MarketCache {
    slots: HashMap<MarketKind, TtlSlot<Vec<Quote>>>,
}

impl MarketCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: MarketKind::ALL
                .into_iter()
                .map(|k| (k, TtlSlot::new(ttl)))
                .collect(),
        }
    }

    pub fn slot(&self, kind: MarketKind) -> &TtlSlot<Vec<Quote>> {
        // Every variant is inserted in `new`.
        &self.slots[&kind]
    }

    pub fn reset(&self) {
        for slot in self.slots.values() {
            slot.reset();
        }
    }
}

/// Re-entrancy flag for the legacy endpoint: while one request refreshes,
/// others serve stale data.
#[derive(Debug, Default)]
pub struct RefreshFlag(AtomicBool);

pub struct RefreshGuard<'a>(&'a AtomicBool);

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RefreshFlag {
    /// `None` when another refresh holds the flag.
    pub fn try_begin(&self) -> Option<RefreshGuard<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RefreshGuard(&self.0))
    }

    pub fn is_refreshing(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Every mirror cache, owned by the router state for the process lifetime.
#[derive(Debug)]
pub struct MirrorCaches {
    pub news: TtlSlot<Vec<NewsItem>>,
    pub markets: MarketCache,
    pub twitter: TtlSlot<Vec<Tweet>>,
    pub legacy_news: TtlSlot<Vec<NewsItem>>,
    pub legacy_refreshing: RefreshFlag,
}

impl Default for MirrorCaches {
    fn default() -> Self {
        Self {
            news: TtlSlot::new(NEWS_TTL),
            markets: MarketCache::new(MARKET_TTL),
            twitter: TtlSlot::new(TWITTER_TTL),
            legacy_news: TtlSlot::new(LEGACY_NEWS_TTL),
            legacy_refreshing: RefreshFlag::default(),
        }
    }
}

impl MirrorCaches {
    pub fn reset(&self) {
        self.news.reset();
        self.markets.reset();
        self.twitter.reset();
        self.legacy_news.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn slot_expires_after_ttl_but_stays_readable() {
        let slot = TtlSlot::new(Duration::from_secs(45));
        assert_eq!(slot.get_fresh(), None::<u32>);

        slot.put(7u32);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(slot.get_fresh(), Some(7));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(slot.get_fresh(), None);
        let (v, age) = slot.get_any().unwrap();
        assert_eq!(v, 7);
        assert_eq!(age, Duration::from_secs(50));

        slot.reset();
        assert!(slot.get_any().is_none());
    }

    #[test]
    fn market_kinds_have_separate_slots() {
        let cache = MarketCache::new(MARKET_TTL);
        let q = Quote {
            symbol: "XLK".into(),
            name: "Technology".into(),
            price: 1.0,
            change: 0.0,
            change_percent: 0.0,
        };
        cache.slot(MarketKind::Sectors).put(vec![q]);
        assert!(cache.slot(MarketKind::Indices).get_fresh().is_none());
        assert_eq!(cache.slot(MarketKind::Sectors).get_fresh().unwrap().len(), 1);
    }

    #[test]
    fn refresh_flag_is_exclusive_and_released_on_drop() {
        let flag = RefreshFlag::default();
        let g = flag.try_begin().expect("first refresh");
        assert!(flag.is_refreshing());
        assert!(flag.try_begin().is_none());
        drop(g);
        assert!(!flag.is_refreshing());
        assert!(flag.try_begin().is_some());
    }
}
