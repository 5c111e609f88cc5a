// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Geocontrol Worker - manifest monitoring and regulator reporting
//!
//! Runs the full pipeline against the configured store, telemetry platform
//! and regulator:
//! - Manifest synchronization
//! - Geofence monitoring
//! - Report and exception report dispatch
//! - Exception detection
//! - Audit log retention

use std::sync::Arc;
use tracing::{info, warn};

use geocontrol_core::{StoreInteractionSink, store};
use geocontrol_gateways::{RegulatorClient, TelemetryClient};
use geocontrol_worker::config::{Config, LogFormat};
use geocontrol_worker::runtime::GeocontrolRuntime;

const DEFAULT_FILTER: &str = "geocontrol_worker=info,geocontrol_gateways=info,geocontrol_core=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before reading the log format
    let dotenv = dotenvy::dotenv();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_FILTER.into());
    match config.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    info!(
        regulator_endpoint = %config.regulator_endpoint,
        position_api_url = %config.position_api_url,
        resync_policy = ?config.resync_policy,
        "Starting Geocontrol Worker"
    );

    // Connect to the store (migrations run on connect)
    let store = store::connect(&config.database_url).await?;
    info!("Connected to database");

    // Gateways
    let position = Arc::new(TelemetryClient::new(config.telemetry_config())?);
    let sink = Arc::new(StoreInteractionSink::new(store.clone()));
    let regulator = Arc::new(RegulatorClient::new(config.regulator_config(), sink)?);

    if config.position_admin_credentials.is_none() {
        warn!("No telemetry admin credentials; unknown plates cannot be looked up or enrolled");
    }

    // Start the runtime
    let runtime = GeocontrolRuntime::builder()
        .store(store)
        .position(position)
        .regulator(regulator)
        .sync_config(config.sync_config())
        .monitor_config(config.monitor_config())
        .dispatcher_config(config.dispatcher_config())
        .exception_detector_config(config.exception_detector_config())
        .exception_dispatcher_config(config.exception_dispatcher_config())
        .audit_retention_config(config.audit_retention_config())
        .build()?
        .start()?;

    info!("Geocontrol Worker ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Geocontrol Worker shut down");

    Ok(())
}
