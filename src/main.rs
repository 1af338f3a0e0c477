//! Situation Monitor backend mirror: Shuttle/Axum entrypoint.

use shuttle_axum::ShuttleAxum;

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    situation_monitor::logging::init_tracing();

    let router = situation_monitor::app().map_err(shuttle_runtime::Error::Custom)?;
    tracing::info!("backend mirror ready");
    Ok(router.into())
}
