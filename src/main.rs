// src/main.rs
mod api;
mod collision;
mod compaction;
mod config;
mod engine;
mod error;
mod geometry;
mod model;
mod optimizer;
mod penetration;
mod pipeline;
mod placement;
mod resting;
mod types;
mod voxel;

use config::AppConfig;

#[tokio::main]
async fn main() {
    // .env first so it can carry RUST_LOG.
    let dotenv = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = dotenv {
        if !matches!(err, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            log::warn!("Could not load .env: {}", err);
        }
    }

    let app_config = AppConfig::from_env();
    log::info!("Placement service starting...");
    api::start_api_server(app_config.api, app_config.layout, app_config.engine, app_config.anneal).await;
}
