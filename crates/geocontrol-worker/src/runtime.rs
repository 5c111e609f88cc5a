// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for geocontrol-worker.
//!
//! [`GeocontrolRuntime`] spawns every background job on the current tokio
//! runtime so the pipeline can run inside an existing application instead of
//! the standalone binary.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use geocontrol_core::store;
//! use geocontrol_worker::runtime::GeocontrolRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = store::connect("sqlite:geocontrol.db").await?;
//!
//!     let runtime = GeocontrolRuntime::builder()
//!         .store(store)
//!         .position(position_gateway)
//!         .regulator(regulator_gateway)
//!         .build()?
//!         .start()?;
//!
//!     // Operator actions go through the runtime's operations handle.
//!     let counts = runtime.operations().report_counts(None).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use geocontrol_core::Store;
use geocontrol_gateways::{PositionGateway, RegulatorGateway};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::audit_retention::{AuditRetention, AuditRetentionConfig};
use crate::dispatcher::{ReportDispatcher, ReportDispatcherConfig};
use crate::exception_detector::{ExceptionDetector, ExceptionDetectorConfig};
use crate::exception_dispatcher::{ExceptionDispatcher, ExceptionDispatcherConfig};
use crate::monitor::{GeofenceMonitor, GeofenceMonitorConfig};
use crate::operations::Operations;
use crate::sync::{ManifestSyncConfig, ManifestSynchronizer};

/// Builder for creating a [`GeocontrolRuntime`].
#[derive(Default)]
pub struct GeocontrolRuntimeBuilder {
    store: Option<Arc<dyn Store>>,
    position: Option<Arc<dyn PositionGateway>>,
    regulator: Option<Arc<dyn RegulatorGateway>>,
    sync: ManifestSyncConfig,
    monitor: GeofenceMonitorConfig,
    dispatcher: ReportDispatcherConfig,
    exception_detector: ExceptionDetectorConfig,
    exception_dispatcher: ExceptionDispatcherConfig,
    audit_retention: AuditRetentionConfig,
}

impl GeocontrolRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the telemetry platform gateway (required).
    pub fn position(mut self, position: Arc<dyn PositionGateway>) -> Self {
        self.position = Some(position);
        self
    }

    /// Set the regulator gateway (required).
    pub fn regulator(mut self, regulator: Arc<dyn RegulatorGateway>) -> Self {
        self.regulator = Some(regulator);
        self
    }

    /// Set the manifest synchronizer configuration.
    ///
    /// Default: every 15 minutes, full sync daily, completed manifests preserved
    pub fn sync_config(mut self, config: ManifestSyncConfig) -> Self {
        self.sync = config;
        self
    }

    /// Set the geofence monitor configuration.
    ///
    /// Default: every minute
    pub fn monitor_config(mut self, config: GeofenceMonitorConfig) -> Self {
        self.monitor = config;
        self
    }

    /// Set the report dispatcher configuration.
    ///
    /// Default: every 30 seconds, 20 reports per cycle
    pub fn dispatcher_config(mut self, config: ReportDispatcherConfig) -> Self {
        self.dispatcher = config;
        self
    }

    /// Set the exception detector configuration.
    ///
    /// Default: every hour
    pub fn exception_detector_config(mut self, config: ExceptionDetectorConfig) -> Self {
        self.exception_detector = config;
        self
    }

    /// Set the exception dispatcher configuration.
    ///
    /// Default: every 15 minutes, 20 exception reports per cycle
    pub fn exception_dispatcher_config(mut self, config: ExceptionDispatcherConfig) -> Self {
        self.exception_dispatcher = config;
        self
    }

    /// Set the audit retention configuration.
    ///
    /// Default: hourly, 7 days retention
    pub fn audit_retention_config(mut self, config: AuditRetentionConfig) -> Self {
        self.audit_retention = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<GeocontrolRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let position = self
            .position
            .ok_or_else(|| anyhow::anyhow!("position gateway is required"))?;
        let regulator = self
            .regulator
            .ok_or_else(|| anyhow::anyhow!("regulator gateway is required"))?;

        Ok(GeocontrolRuntimeConfig {
            store,
            position,
            regulator,
            sync: self.sync,
            monitor: self.monitor,
            dispatcher: self.dispatcher,
            exception_detector: self.exception_detector,
            exception_dispatcher: self.exception_dispatcher,
            audit_retention: self.audit_retention,
        })
    }
}

/// Configuration for a [`GeocontrolRuntime`].
pub struct GeocontrolRuntimeConfig {
    store: Arc<dyn Store>,
    position: Arc<dyn PositionGateway>,
    regulator: Arc<dyn RegulatorGateway>,
    sync: ManifestSyncConfig,
    monitor: GeofenceMonitorConfig,
    dispatcher: ReportDispatcherConfig,
    exception_detector: ExceptionDetectorConfig,
    exception_dispatcher: ExceptionDispatcherConfig,
    audit_retention: AuditRetentionConfig,
}

/// A spawned job and the handle that stops it.
struct Job {
    name: &'static str,
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl GeocontrolRuntimeConfig {
    /// Start the runtime, spawning one task per background job.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self) -> Result<GeocontrolRuntime> {
        let mut jobs = Vec::with_capacity(6);

        let synchronizer = Arc::new(ManifestSynchronizer::new(
            self.store.clone(),
            self.position.clone(),
            self.regulator.clone(),
            self.sync,
        ));
        let sync_job = synchronizer.clone();
        jobs.push(Job {
            name: "Manifest synchronizer",
            shutdown: synchronizer.shutdown_handle(),
            handle: tokio::spawn(async move {
                sync_job.run().await;
            }),
        });

        let monitor = GeofenceMonitor::new(self.store.clone(), self.position.clone(), self.monitor);
        jobs.push(Job {
            name: "Geofence monitor",
            shutdown: monitor.shutdown_handle(),
            handle: tokio::spawn(async move {
                monitor.run().await;
            }),
        });

        let dispatcher =
            ReportDispatcher::new(self.store.clone(), self.regulator.clone(), self.dispatcher);
        jobs.push(Job {
            name: "Report dispatcher",
            shutdown: dispatcher.shutdown_handle(),
            handle: tokio::spawn(async move {
                dispatcher.run().await;
            }),
        });

        let detector = ExceptionDetector::new(self.store.clone(), self.exception_detector);
        jobs.push(Job {
            name: "Exception detector",
            shutdown: detector.shutdown_handle(),
            handle: tokio::spawn(async move {
                detector.run().await;
            }),
        });

        let exception_dispatcher = ExceptionDispatcher::new(
            self.store.clone(),
            self.regulator.clone(),
            self.exception_dispatcher,
        );
        jobs.push(Job {
            name: "Exception dispatcher",
            shutdown: exception_dispatcher.shutdown_handle(),
            handle: tokio::spawn(async move {
                exception_dispatcher.run().await;
            }),
        });

        let retention = AuditRetention::new(self.store.clone(), self.audit_retention);
        jobs.push(Job {
            name: "Audit retention",
            shutdown: retention.shutdown_handle(),
            handle: tokio::spawn(async move {
                retention.run().await;
            }),
        });

        let operations = Operations::new(self.store, self.regulator, synchronizer);

        info!(jobs = jobs.len(), "GeocontrolRuntime started");

        Ok(GeocontrolRuntime { jobs, operations })
    }
}

/// A running geocontrol pipeline that can be embedded in an application.
///
/// The runtime manages:
/// - Manifest synchronizer
/// - Geofence monitor
/// - Report dispatcher
/// - Exception detector and dispatcher
/// - Audit log retention
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct GeocontrolRuntime {
    jobs: Vec<Job>,
    operations: Operations,
}

impl GeocontrolRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> GeocontrolRuntimeBuilder {
        GeocontrolRuntimeBuilder::new()
    }

    /// Operator operations sharing the runtime's store and synchronizer.
    pub fn operations(&self) -> &Operations {
        &self.operations
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals every job to stop, then waits for in-flight cycles to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("GeocontrolRuntime shutting down...");

        for job in &self.jobs {
            job.shutdown.notify_one();
        }

        let mut panicked = 0;
        for job in self.jobs {
            if let Err(e) = job.handle.await {
                panicked += 1;
                error!("{} task panicked: {}", job.name, e);
            }
        }

        if panicked > 0 {
            return Err(anyhow::anyhow!("{panicked} job task(s) panicked"));
        }

        info!("GeocontrolRuntime shutdown complete");
        Ok(())
    }

    /// Check if every job is still running.
    pub fn is_running(&self) -> bool {
        self.jobs.iter().all(|job| !job.handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geocontrol_core::SqliteStore;
    use geocontrol_gateways::{MockPositionGateway, MockRegulatorGateway};

    #[test]
    fn test_build_requires_store() {
        let result = GeocontrolRuntime::builder()
            .position(Arc::new(MockPositionGateway::new()))
            .regulator(Arc::new(MockRegulatorGateway::new()))
            .build();

        let err = result.err().expect("build should fail");
        assert!(err.to_string().contains("store is required"));
    }

    #[test]
    fn test_build_requires_gateways() {
        let err = GeocontrolRuntime::builder().build().err().expect("build should fail");
        assert!(err.to_string().contains("is required"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::connect("sqlite::memory:").await.unwrap());

        let runtime = GeocontrolRuntime::builder()
            .store(store)
            .position(Arc::new(MockPositionGateway::new()))
            .regulator(Arc::new(MockRegulatorGateway::new()))
            .build()
            .unwrap()
            .start()
            .unwrap();

        assert!(runtime.is_running());
        let counts = runtime.operations().report_counts(None).await.unwrap();
        assert_eq!(counts.total(), 0);

        runtime.shutdown().await.unwrap();
    }
}
