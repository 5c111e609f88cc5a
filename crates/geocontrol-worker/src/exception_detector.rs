// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exception detector.
//!
//! Creates exception reports for control points the vehicle never reached
//! while the point's appointment is 24 to 36 hours in the past:
//!
//! | Code | Manifests scanned | Points |
//! |------|-------------------|--------|
//! | 1, vehicle not seen | active, monitorable | still `pending` |
//! | 2, plate not registered | active, plate unknown to the telemetry platform | any |
//!
//! A point gets no exception report if it already has one, or has a report.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use geocontrol_core::schedule::exception_window_open;
use geocontrol_core::{ControlPoint, ControlPointState, ExceptionCode, ExceptionReport, Manifest, Store};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::guard::JobGuard;

/// Configuration for the exception detector.
#[derive(Debug, Clone)]
pub struct ExceptionDetectorConfig {
    /// How often to scan.
    pub poll_interval: Duration,
}

impl Default for ExceptionDetectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// Counters for one detection cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetectionSummary {
    /// Points inside the exception window.
    pub candidates: usize,
    /// Code 1 reports created.
    pub not_seen: usize,
    /// Code 2 reports created.
    pub not_registered: usize,
    /// Candidates that already had a report or exception report.
    pub already_covered: usize,
    /// Candidates that failed to process.
    pub errors: usize,
}

/// Background job that turns missed control points into exception reports.
pub struct ExceptionDetector {
    store: Arc<dyn Store>,
    config: ExceptionDetectorConfig,
    guard: JobGuard,
    shutdown: Arc<Notify>,
}

impl ExceptionDetector {
    /// Create a new detector.
    pub fn new(store: Arc<dyn Store>, config: ExceptionDetectorConfig) -> Self {
        Self {
            store,
            config,
            guard: JobGuard::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the detection loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Exception detector started"
        );

        loop {
            if let Err(e) = self.run_once(Utc::now()).await {
                error!(error = %e, "Exception detection cycle failed");
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Exception detector received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Exception detector stopped");
    }

    /// Run one cycle at `now`. Returns `None` when a cycle is already running.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<Option<DetectionSummary>> {
        let Some(_permit) = self.guard.try_enter() else {
            debug!("Exception detector still running, skipping tick");
            return Ok(None);
        };
        self.detect(now).await.map(Some)
    }

    async fn detect(&self, now: DateTime<Utc>) -> Result<DetectionSummary> {
        let mut summary = DetectionSummary::default();

        for manifest in self.store.list_monitorable_manifests().await? {
            for point in manifest
                .control_points
                .iter()
                .filter(|p| p.state == ControlPointState::Pending && in_window(p, now))
            {
                let detail = format!(
                    "vehicle {} did not appear within the tolerance window for control point {}",
                    manifest.plate, point.code
                );
                self.consider(&manifest, point, ExceptionCode::VehicleNotSeen, detail, now, &mut summary)
                    .await;
            }
        }

        for manifest in self.store.list_unregistered_manifests().await? {
            let reason = manifest
                .not_monitorable
                .as_ref()
                .map(|r| r.detail.clone())
                .unwrap_or_default();
            for point in manifest.control_points.iter().filter(|p| in_window(p, now)) {
                let detail = format!(
                    "plate {} not registered on telemetry platform: {}",
                    manifest.plate, reason
                );
                self.consider(&manifest, point, ExceptionCode::PlateNotRegistered, detail, now, &mut summary)
                    .await;
            }
        }

        info!(
            candidates = summary.candidates,
            not_seen = summary.not_seen,
            not_registered = summary.not_registered,
            already_covered = summary.already_covered,
            errors = summary.errors,
            "Exception detection completed"
        );

        Ok(summary)
    }

    async fn consider(
        &self,
        manifest: &Manifest,
        point: &ControlPoint,
        code: ExceptionCode,
        detail: String,
        now: DateTime<Utc>,
        summary: &mut DetectionSummary,
    ) {
        summary.candidates += 1;
        match self.create(manifest, point, code, detail, now).await {
            Ok(true) => match code {
                ExceptionCode::PlateNotRegistered => summary.not_registered += 1,
                _ => summary.not_seen += 1,
            },
            Ok(false) => summary.already_covered += 1,
            Err(e) => {
                summary.errors += 1;
                error!(
                    manifest = %manifest.external_id,
                    point_code = point.code,
                    code = code.code(),
                    error = %e,
                    "Failed to create exception report"
                );
            }
        }
    }

    /// Create the exception report unless the point is already covered.
    ///
    /// Returns `true` when a report was created.
    async fn create(
        &self,
        manifest: &Manifest,
        point: &ControlPoint,
        code: ExceptionCode,
        detail: String,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if self
            .store
            .find_report_for_point(manifest.id, point.id)
            .await?
            .is_some()
            || self
                .store
                .find_exception_for_point(manifest.id, point.id)
                .await?
                .is_some()
        {
            return Ok(false);
        }

        let exception = ExceptionReport::for_missed_point(manifest, point, code, Some(detail), now)?;
        match self.store.insert_exception(&exception).await {
            Ok(()) => {}
            Err(e) if e.is_conflict() => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        info!(
            exception_id = %exception.id,
            manifest = %manifest.external_id,
            plate = %manifest.plate,
            point_code = point.code,
            code = code.code(),
            deadline = %exception.deadline,
            "Exception report created"
        );
        Ok(true)
    }
}

fn in_window(point: &ControlPoint, now: DateTime<Utc>) -> bool {
    point
        .appointment
        .is_some_and(|appointment| exception_window_open(appointment, now))
}
