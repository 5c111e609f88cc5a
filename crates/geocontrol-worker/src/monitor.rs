// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Geofence monitor.
//!
//! Polls one position per monitorable manifest and moves its control points
//! through `pending` → `at_point` → `completed`:
//!
//! - entering a pending point's geofence records the arrival and queues a report
//! - leaving an `at_point` geofence records the departure and requeues the
//!   report so the departure is sent
//! - 72 hours inside a geofence flags the report "no departure"
//!
//! Manifests with no point in its monitoring window are not polled. Every
//! detection is timestamped with the cycle time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use geocontrol_core::{
    ControlPoint, ControlPointState, DepartureOutcome, Fix, Manifest, Report, Store, SubmissionState,
};
use geocontrol_gateways::PositionGateway;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::guard::JobGuard;

/// Configuration for the geofence monitor.
#[derive(Debug, Clone)]
pub struct GeofenceMonitorConfig {
    /// How often to poll positions.
    pub poll_interval: Duration,
}

impl Default for GeofenceMonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Counters for one monitor cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorSummary {
    /// Manifests with a point in its monitoring window.
    pub polled: usize,
    /// Manifests skipped for lack of a vehicle id or position.
    pub without_position: usize,
    /// Arrivals recorded.
    pub arrivals: usize,
    /// Departures recorded.
    pub departures: usize,
    /// Reports newly flagged "no departure".
    pub no_departure: usize,
    /// Manifests completed.
    pub completed: usize,
    /// Manifests that failed to process.
    pub errors: usize,
}

/// Background job that evaluates vehicle positions against control points.
pub struct GeofenceMonitor {
    store: Arc<dyn Store>,
    position: Arc<dyn PositionGateway>,
    config: GeofenceMonitorConfig,
    guard: JobGuard,
    shutdown: Arc<Notify>,
}

impl GeofenceMonitor {
    /// Create a new monitor.
    pub fn new(
        store: Arc<dyn Store>,
        position: Arc<dyn PositionGateway>,
        config: GeofenceMonitorConfig,
    ) -> Self {
        Self {
            store,
            position,
            config,
            guard: JobGuard::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the monitor loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Geofence monitor started"
        );

        loop {
            if let Err(e) = self.run_once(Utc::now()).await {
                error!(error = %e, "Geofence monitor cycle failed");
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Geofence monitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Geofence monitor stopped");
    }

    /// Run one cycle at `now`. Returns `None` when a cycle is already running.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<Option<MonitorSummary>> {
        let Some(_permit) = self.guard.try_enter() else {
            debug!("Geofence monitor still running, skipping tick");
            return Ok(None);
        };
        self.poll(now).await.map(Some)
    }

    async fn poll(&self, now: DateTime<Utc>) -> Result<MonitorSummary> {
        let mut summary = MonitorSummary::default();

        let due: Vec<Manifest> = self
            .store
            .list_monitorable_manifests()
            .await?
            .into_iter()
            .filter(|m| m.needs_polling(now))
            .collect();

        if due.is_empty() {
            debug!("No manifests in their monitoring window");
            return Ok(summary);
        }

        let fleet: HashMap<String, i64> = self
            .position
            .list_authorized_vehicles()
            .await?
            .into_iter()
            .map(|v| (v.plate.to_uppercase(), v.id))
            .collect();

        for manifest in due {
            summary.polled += 1;
            let manifest_id = manifest.id;
            let plate = manifest.plate.clone();
            if let Err(e) = self.track(manifest, &fleet, now, &mut summary).await {
                summary.errors += 1;
                error!(manifest_id = %manifest_id, plate = %plate, error = %e, "Failed to track manifest");
            }
        }

        info!(
            polled = summary.polled,
            without_position = summary.without_position,
            arrivals = summary.arrivals,
            departures = summary.departures,
            no_departure = summary.no_departure,
            completed = summary.completed,
            errors = summary.errors,
            "Geofence monitor cycle completed"
        );

        Ok(summary)
    }

    async fn vehicle_id(&self, plate: &str, fleet: &HashMap<String, i64>) -> Result<Option<i64>> {
        if let Some(id) = fleet.get(plate) {
            return Ok(Some(*id));
        }
        Ok(self
            .position
            .vehicle_detail_by_plate(plate)
            .await?
            .map(|d| d.id))
    }

    async fn track(
        &self,
        mut manifest: Manifest,
        fleet: &HashMap<String, i64>,
        now: DateTime<Utc>,
        summary: &mut MonitorSummary,
    ) -> Result<()> {
        let Some(vehicle_id) = self.vehicle_id(&manifest.plate, fleet).await? else {
            warn!(plate = %manifest.plate, "Vehicle unknown to telemetry platform");
            summary.without_position += 1;
            return Ok(());
        };

        // One position serves every point of the manifest this cycle.
        let Some(position) = self.position.last_position(vehicle_id).await? else {
            debug!(plate = %manifest.plate, vehicle_id, "No position available");
            summary.without_position += 1;
            return Ok(());
        };
        let here = position.point();
        let fix = Fix::new(now, here);

        let mut touched = Vec::new();
        for idx in 0..manifest.control_points.len() {
            let point = &manifest.control_points[idx];
            let inside = point.geofence().contains(&here);
            let dwell_exceeded = point.dwell_exceeded(now);
            let state = point.state;

            match state {
                ControlPointState::Completed => {}
                ControlPointState::Pending if inside => {
                    self.arrive(&mut manifest, idx, fix).await?;
                    summary.arrivals += 1;
                    touched.push(idx);
                }
                ControlPointState::Pending => {}
                ControlPointState::AtPoint if !inside => {
                    self.depart(&mut manifest, idx, fix, now).await?;
                    summary.departures += 1;
                    touched.push(idx);
                }
                ControlPointState::AtPoint if dwell_exceeded => {
                    if self.flag_no_departure(&mut manifest, idx, now).await? {
                        summary.no_departure += 1;
                        touched.push(idx);
                    }
                }
                ControlPointState::AtPoint => {}
            }
        }

        let completed = manifest.complete_if_done();
        if completed {
            summary.completed += 1;
            info!(manifest = %manifest.external_id, plate = %manifest.plate, "Manifest completed");
        }

        // Confirmations and feed data belong to other jobs; write tracking only.
        if completed || !touched.is_empty() {
            let points: Vec<ControlPoint> = touched
                .into_iter()
                .map(|idx| manifest.control_points[idx].clone())
                .collect();
            self.store
                .save_tracking(
                    manifest.id,
                    completed.then_some(manifest.state),
                    &points,
                    now,
                )
                .await?;
        }

        Ok(())
    }

    /// Record an arrival and queue its report.
    ///
    /// No report is created when the point's exception report was already
    /// accepted. A report left behind by an interrupted cycle is linked
    /// instead of duplicated.
    async fn arrive(&self, manifest: &mut Manifest, idx: usize, fix: Fix) -> Result<()> {
        let point = manifest.control_points[idx].clone();

        let exception = self
            .store
            .find_exception_for_point(manifest.id, point.id)
            .await?;
        let report_id = if exception.is_some_and(|e| e.state == SubmissionState::Reported) {
            info!(
                manifest = %manifest.external_id,
                point_code = point.code,
                "Arrival after accepted exception report, no report queued"
            );
            None
        } else {
            let report = Report::for_arrival(manifest, &point, fix);
            match self.store.insert_report(&report).await {
                Ok(()) => Some(report.id),
                Err(e) if e.is_conflict() => self
                    .store
                    .find_report_for_point(manifest.id, point.id)
                    .await?
                    .map(|r| r.id),
                Err(e) => return Err(e.into()),
            }
        };

        let point = &mut manifest.control_points[idx];
        point.record_arrival(fix)?;
        point.report_id = report_id.or(point.report_id);

        info!(
            manifest = %manifest.external_id,
            plate = %manifest.plate,
            point_code = point.code,
            report_id = ?point.report_id,
            latitude = fix.point.latitude,
            longitude = fix.point.longitude,
            "Arrival detected"
        );
        Ok(())
    }

    /// Record a departure and push it onto the point's report.
    async fn depart(
        &self,
        manifest: &mut Manifest,
        idx: usize,
        fix: Fix,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let point = &mut manifest.control_points[idx];
        point.record_departure(fix)?;
        let point_code = point.code;
        let report_id = point.report_id;

        let outcome = match report_id {
            Some(id) => match self.store.get_report(id).await? {
                Some(mut report) => {
                    let outcome = report.record_departure(fix, now);
                    self.store.update_report(&report).await?;
                    Some(outcome)
                }
                None => {
                    warn!(report_id = %id, "Linked report not found");
                    None
                }
            },
            None => None,
        };

        info!(
            manifest = %manifest.external_id,
            plate = %manifest.plate,
            point_code,
            report_id = ?report_id,
            requeued = outcome == Some(DepartureOutcome::Requeued),
            "Departure detected"
        );
        Ok(())
    }

    /// Flag the report of a point the vehicle never left.
    ///
    /// Returns `true` when the flag was newly set.
    async fn flag_no_departure(
        &self,
        manifest: &mut Manifest,
        idx: usize,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let point = &mut manifest.control_points[idx];
        if point.no_departure {
            return Ok(false);
        }
        point.no_departure = true;

        if let Some(id) = point.report_id
            && let Some(mut report) = self.store.get_report(id).await?
            && !report.no_departure
            && report.departure.is_none()
        {
            report.no_departure = true;
            report.updated_at = now;
            self.store.update_report(&report).await?;
        }

        warn!(
            manifest = %manifest.external_id,
            plate = %manifest.plate,
            point_code = point.code,
            "No departure within 72 hours of arrival"
        );
        Ok(true)
    }
}
