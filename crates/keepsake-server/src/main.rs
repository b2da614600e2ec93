//! # keepsake-server
//!
//! HTTP service for Keepsake time capsules.
//!
//! This binary provides:
//! - **Capsule API** (axum): create, list, read-only lock verdicts and the
//!   atomic evaluate-and-open flow
//! - **Encrypted file storage**: uploads are sealed with AES-256-GCM under
//!   the master key and written to a filesystem blob store
//! - **Public wall** of unlocked public capsules
//! - **Entitlement checks** against tokens signed by the payment gateway
//! - **Background unlock sweep** that flips due capsules and publishes the
//!   public ones

mod api;
mod auth;
mod blob_store;
mod capsules;
mod config;
mod entitlement;
mod error;

use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use keepsake_shared::constants::APP_NAME;
use keepsake_store::Database;

use crate::api::AppState;
use crate::blob_store::BlobStore;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,keepsake_server=debug")),
        )
        .init();

    info!("Starting {} server v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    info!(
        entitlement_required = config.entitlement_required,
        free_tier_capsule_limit = config.free_tier_capsule_limit,
        admin_enabled = config.admin_token.is_some(),
        "Instance settings"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;

    let blob_store = BlobStore::new(
        config.blob_storage_path.clone(),
        api::max_blob_size(config.max_upload_size),
        config.public_base_url.clone(),
    )
    .await?;

    let http_addr = config.http_addr;
    let sweep_interval = config.sweep_interval_secs;
    let app_state = AppState::new(config, db, blob_store);

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Unlock sweep: flips due capsules and publishes public ones.
    if sweep_interval > 0 {
        let capsules = app_state.capsules.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));
            loop {
                interval.tick().await;
                if let Err(e) = capsules.run_unlock_sweep(Utc::now()).await {
                    warn!(error = %e, "Unlock sweep failed");
                }
            }
        });
    } else {
        info!("Background unlock sweep disabled");
    }

    // Periodic entitlement cache cleanup (every 10 minutes)
    let entitlements = app_state.entitlements.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(600));
        loop {
            interval.tick().await;
            entitlements.purge_expired().await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
