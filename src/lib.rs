// Declare the modules
pub mod access;
pub mod api;
pub mod blob;
pub mod commands;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod models;
pub mod persistence;
pub mod quota;
pub mod settings;
pub mod state;
pub mod storage;
pub mod stream;

use crate::api::{HttpModelProxy, ModelProxy};
use crate::commands::ChatShell;
use crate::config::AppConfig;
use crate::quota::MemoryLocalStore;
use crate::state::AppState;
use crate::storage::StorageManager;
use anyhow::Context;
use std::sync::Arc;

const ANON_KEY_ACCOUNT: &str = "anon_key";

pub async fn run() -> anyhow::Result<()> {
    // A missing .env file is fine
    dotenvy::dotenv().ok();
    env_logger::init();

    let config = AppConfig::from_env().context("Failed to read configuration")?;
    log::info!("Using model proxy at {}", config.proxy_url);

    let storage_manager = StorageManager::connect(&config.database_url).await?;

    let anon_key = match crate::config::resolve_secret(config.anon_key_ref.as_deref(), ANON_KEY_ACCOUNT) {
        Ok(key) => Some(key),
        Err(e) => {
            log::warn!("No anonymous key available, guest requests will be unauthenticated: {:#}", e);
            None
        }
    };

    let api_provider: Arc<dyn ModelProxy> = Arc::new(HttpModelProxy::new(config.proxy_url.clone(), anon_key));
    let app_state = AppState::new(
        config,
        Arc::new(storage_manager),
        api_provider,
        Arc::new(MemoryLocalStore::new()),
    );

    if let Err(e) = app_state.settings.load(app_state.storage.as_ref()).await {
        log::error!("Falling back to default platform settings: {:#}", e);
    }

    ChatShell::new(app_state).run_stdin().await
}
