//! Terminal runner: drives the live-data coordinator against the real
//! upstreams and logs every status change until Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use situation_monitor::config::AppConfig;
use situation_monitor::ingest::config::SourceRegistry;
use situation_monitor::ingest::jobs::default_jobs;
use situation_monitor::store::MemoryStore;
use situation_monitor::{DataClass, FetchContext, LiveDataCoordinator};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    situation_monitor::logging::init_tracing();

    let sources = SourceRegistry::load_default().context("loading source table")?;
    let ctx = FetchContext::client(AppConfig::from_env(), sources)?;
    let store = Arc::new(MemoryStore::new());
    let coordinator = LiveDataCoordinator::new(default_jobs(&ctx), store.clone());

    let mut status = coordinator.subscribe();
    coordinator.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = status.borrow_and_update().clone();
                let loading: Vec<&str> = DataClass::ALL
                    .into_iter()
                    .filter(|c| snap.is_loading(*c))
                    .map(DataClass::as_str)
                    .collect();
                info!(
                    busy = snap.busy,
                    loading = ?loading,
                    errors = snap.errors.len(),
                    news = store.len_of("news"),
                    quakes = store.len_of("earthquakes"),
                    conflicts = store.len_of("conflicts"),
                    "status"
                );
            }
        }
    }

    coordinator.stop();
    info!(keys = ?store.keys(), "monitor stopped");
    Ok(())
}
