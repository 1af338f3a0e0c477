// src/ingest/scheduler.rs
//! Live-data coordinator: one recurring timer per data class, an immediate
//! first run on start, manual refresh, and a status channel for the UI.
//!
//! Runs are keyed by class in an [`InFlight`] table. A manual refresh cancels
//! the class's running fetch and starts over; a timer tick finding the class
//! still running skips instead, so a slow upstream is never starved.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::store::StateStore;

/// Delay before the global busy flag drops after the last class finishes.
pub const BUSY_SETTLE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataClass {
    News,
    Conflicts,
    Markets,
    Earthquakes,
    Special,
}

impl DataClass {
    pub const ALL: [DataClass; 5] = [
        Self::News,
        Self::Conflicts,
        Self::Markets,
        Self::Earthquakes,
        Self::Special,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::News => "news",
            Self::Conflicts => "conflicts",
            Self::Markets => "markets",
            Self::Earthquakes => "earthquakes",
            Self::Special => "special",
        }
    }

    pub fn default_interval(self) -> Duration {
        match self {
            Self::News => Duration::from_secs(60),
            Self::Conflicts => Duration::from_secs(300),
            Self::Markets => Duration::from_secs(30),
            Self::Earthquakes => Duration::from_secs(120),
            Self::Special => Duration::from_secs(300),
        }
    }
}

/// One data class's fetch. Entries returned are written to the store under
/// their keys; an `Err` leaves the store untouched.
#[async_trait]
pub trait DataJob: Send + Sync {
    fn class(&self) -> DataClass;

    fn interval(&self) -> Duration {
        self.class().default_interval()
    }

    async fn run(&self, cancel: &CancellationToken) -> anyhow::Result<Vec<(String, Value)>>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub loading: BTreeMap<DataClass, bool>,
    pub last_updated: BTreeMap<DataClass, DateTime<Utc>>,
    pub errors: BTreeMap<DataClass, String>,
    pub busy: bool,
}

impl StatusSnapshot {
    pub fn is_loading(&self, class: DataClass) -> bool {
        self.loading.get(&class).copied().unwrap_or(false)
    }
}

/// Latest-wins table: at most one live run per key.
#[derive(Debug, Default)]
pub struct InFlight {
    slots: Mutex<HashMap<String, (u64, CancellationToken)>>,
    seq: AtomicU64,
}

pub struct InFlightGuard<'a> {
    owner: &'a InFlight,
    key: String,
    seq: u64,
    token: CancellationToken,
}

impl InFlightGuard<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut slots = self.owner.slots.lock();
        if slots.get(&self.key).is_some_and(|(seq, _)| *seq == self.seq) {
            slots.remove(&self.key);
        }
    }
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel whatever is running under `key` and register a new run whose
    /// token is a child of `parent`.
    pub fn begin(&self, key: &str, parent: &CancellationToken) -> InFlightGuard<'_> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let token = parent.child_token();
        let previous = self
            .slots
            .lock()
            .insert(key.to_string(), (seq, token.clone()));
        if let Some((_, prev)) = previous {
            prev.cancel();
        }
        InFlightGuard {
            owner: self,
            key: key.to_string(),
            seq,
            token,
        }
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.slots.lock().contains_key(key)
    }

    pub fn cancel_all(&self) {
        for (_, (_, token)) in self.slots.lock().drain() {
            token.cancel();
        }
    }
}

struct Shared {
    jobs: Vec<Arc<dyn DataJob>>,
    store: Arc<dyn StateStore>,
    status: watch::Sender<StatusSnapshot>,
    inflight: InFlight,
    shutdown: Mutex<CancellationToken>,
    running: Mutex<HashMap<DataClass, usize>>,
    busy_gen: AtomicU64,
}

/// Clears `loading[class]` however the run ends.
struct LoadingGuard {
    shared: Arc<Shared>,
    class: DataClass,
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.shared.finish(self.class);
    }
}

impl Shared {
    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.lock().clone()
    }

    fn started(self: &Arc<Self>, class: DataClass) -> LoadingGuard {
        *self.running.lock().entry(class).or_default() += 1;
        self.busy_gen.fetch_add(1, Ordering::SeqCst);
        self.status.send_modify(|s| {
            s.loading.insert(class, true);
            s.busy = true;
        });
        LoadingGuard {
            shared: self.clone(),
            class,
        }
    }

    fn finish(self: &Arc<Self>, class: DataClass) {
        let (still_loading, idle) = {
            let mut running = self.running.lock();
            let n = running.entry(class).or_default();
            *n = n.saturating_sub(1);
            let still = *n > 0;
            (still, running.values().all(|n| *n == 0))
        };
        self.status.send_modify(|s| {
            s.loading.insert(class, still_loading);
        });
        if !idle {
            return;
        }

        // Guards can drop while the runtime itself is shutting down.
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let generation = self.busy_gen.load(Ordering::SeqCst);
        let shared = self.clone();
        rt.spawn(async move {
            tokio::time::sleep(BUSY_SETTLE).await;
            let quiet = shared.busy_gen.load(Ordering::SeqCst) == generation
                && shared.running.lock().values().all(|n| *n == 0);
            if quiet {
                shared.status.send_modify(|s| s.busy = false);
            }
        });
    }

    fn spawn_run(self: &Arc<Self>, idx: usize) {
        tokio::spawn(self.clone().run_job(idx));
    }

    async fn run_job(self: Arc<Self>, idx: usize) {
        let job = self.jobs[idx].clone();
        let class = job.class();
        let parent = self.shutdown_token();
        if parent.is_cancelled() {
            return;
        }

        let slot = self.inflight.begin(class.as_str(), &parent);
        let token = slot.token().clone();
        let _loading = self.started(class);
        counter!("coordinator_runs_total", "class" => class.as_str()).increment(1);

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            res = job.run(&token) => Some(res),
        };

        match outcome {
            None => debug!(class = class.as_str(), "run cancelled"),
            Some(_) if token.is_cancelled() => debug!(class = class.as_str(), "run superseded"),
            Some(Ok(entries)) => {
                let keys = entries.len();
                for (key, value) in entries {
                    self.store.set(&key, value);
                }
                self.status.send_modify(|s| {
                    s.last_updated.insert(class, Utc::now());
                    s.errors.remove(&class);
                });
                debug!(class = class.as_str(), keys, "class refreshed");
            }
            Some(Err(e)) => {
                counter!("coordinator_errors_total", "class" => class.as_str()).increment(1);
                warn!(class = class.as_str(), error = %format!("{e:#}"), "class refresh failed");
                self.status.send_modify(|s| {
                    s.errors.insert(class, format!("{e:#}"));
                });
            }
        }
    }

    async fn timer_loop(self: Arc<Self>, idx: usize, shutdown: CancellationToken) {
        let period = self.jobs[idx].interval();
        let class = self.jobs[idx].class();
        self.spawn_run(idx);

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if self.inflight.is_running(class.as_str()) {
                        debug!(class = class.as_str(), "previous run still in flight, tick skipped");
                        continue;
                    }
                    self.spawn_run(idx);
                }
            }
        }
    }
}

pub struct LiveDataCoordinator {
    shared: Arc<Shared>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl LiveDataCoordinator {
    pub fn new(jobs: Vec<Arc<dyn DataJob>>, store: Arc<dyn StateStore>) -> Self {
        let (status, _) = watch::channel(StatusSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                jobs,
                store,
                status,
                inflight: InFlight::new(),
                shutdown: Mutex::new(CancellationToken::new()),
                running: Mutex::new(HashMap::new()),
                busy_gen: AtomicU64::new(0),
            }),
            timers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.shared.status.subscribe()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.shared.status.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.timers.lock().is_empty()
    }

    /// Run every class now, then arm the per-class timers. No-op when
    /// already running. Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut timers = self.timers.lock();
        if !timers.is_empty() {
            return;
        }
        let shutdown = {
            let mut guard = self.shared.shutdown.lock();
            if guard.is_cancelled() {
                *guard = CancellationToken::new();
            }
            guard.clone()
        };
        for idx in 0..self.shared.jobs.len() {
            let shared = self.shared.clone();
            timers.push(tokio::spawn(shared.timer_loop(idx, shutdown.clone())));
        }
        info!(classes = self.shared.jobs.len(), "live data coordinator started");
    }

    /// Re-trigger every class immediately.
    pub fn refresh(&self) {
        for idx in 0..self.shared.jobs.len() {
            self.shared.spawn_run(idx);
        }
    }

    pub fn refresh_class(&self, class: DataClass) {
        for (idx, job) in self.shared.jobs.iter().enumerate() {
            if job.class() == class {
                self.shared.spawn_run(idx);
            }
        }
    }

    /// Abort every timer and cancel in-flight runs.
    pub fn stop(&self) {
        self.shared.shutdown.lock().cancel();
        self.shared.inflight.cancel_all();
        let timers: Vec<_> = self.timers.lock().drain(..).collect();
        let stopped = timers.len();
        for t in timers {
            t.abort();
        }
        if stopped > 0 {
            info!(timers = stopped, "live data coordinator stopped");
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        if enabled {
            self.start();
        } else {
            self.stop();
        }
    }
}

impl Drop for LiveDataCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_intervals() {
        assert_eq!(DataClass::Markets.default_interval(), Duration::from_secs(30));
        assert_eq!(DataClass::News.default_interval(), Duration::from_secs(60));
        assert_eq!(DataClass::Earthquakes.default_interval(), Duration::from_secs(120));
        assert_eq!(DataClass::Conflicts.default_interval(), Duration::from_secs(300));
        assert_eq!(DataClass::Special.default_interval(), Duration::from_secs(300));
    }

    #[test]
    fn inflight_latest_wins() {
        let table = InFlight::new();
        let root = CancellationToken::new();

        let first = table.begin("holocall", &root);
        let first_token = first.token().clone();
        let second = table.begin("holocall", &root);
        assert!(first_token.is_cancelled());
        assert!(!second.token().is_cancelled());

        // The superseded guard must not evict its successor.
        drop(first);
        assert!(table.is_running("holocall"));
        drop(second);
        assert!(!table.is_running("holocall"));
    }

    #[test]
    fn inflight_keys_are_independent_and_follow_parent() {
        let table = InFlight::new();
        let root = CancellationToken::new();
        let a = table.begin("a", &root);
        let b = table.begin("b", &root);
        assert!(!a.token().is_cancelled());

        root.cancel();
        assert!(a.token().is_cancelled() && b.token().is_cancelled());

        let c = table.begin("c", &CancellationToken::new());
        table.cancel_all();
        assert!(c.token().is_cancelled());
    }

    #[test]
    fn status_serializes_class_keys() {
        let mut s = StatusSnapshot::default();
        s.loading.insert(DataClass::News, true);
        s.errors.insert(DataClass::Markets, "boom".into());
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["loading"]["news"], true);
        assert_eq!(v["errors"]["markets"], "boom");
        assert!(s.is_loading(DataClass::News));
        assert!(!s.is_loading(DataClass::Special));
    }
}
