// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Slugforge controller daemon.
//!
//! Accepts source pushes, bootstraps build agents onto platform
//! workers, and publishes finished slugs as releases.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use slugforge_core::agent_binary::AgentBinary;
use slugforge_core::config::Config;
use slugforge_core::server::AppState;
use slugforge_core::{rendezvous, router};
use slugforge_platform::PlatformClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("slugforge_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting slugforge controller");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        addr = %config.listen_addr,
        public_url = %config.public_url,
        api_url = %config.api_url,
        "Configuration loaded"
    );

    let agent = AgentBinary::load(config.agent_path.as_deref())?;

    let matcher = rendezvous::spawn();
    let platform = PlatformClient::new(config.api_url.clone())?;

    let state = AppState {
        config: Arc::new(config.clone()),
        agent: Arc::new(agent),
        matcher,
        platform: Arc::new(platform),
    };

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Controller HTTP server starting");

    axum::serve(listener, router(state)).await?;
    Ok(())
}
