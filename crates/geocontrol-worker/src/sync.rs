// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Manifest synchronizer.
//!
//! Pulls manifests from the regulator, works out whether each vehicle can be
//! monitored and upserts the local records.
//!
//! A cycle:
//! 1. Chooses the query mode: everything when the last full sync is missing
//!    or older than a day, new manifests otherwise.
//! 2. Loads the monitoring account's vehicles. A failure aborts the cycle.
//! 3. Queries the regulator. A failure aborts the cycle; the next tick retries.
//! 4. Classifies and upserts each manifest. A failing manifest is logged and
//!    counted, and the cycle moves on.
//!
//! A failed vehicle lookup leaves an existing manifest's classification as
//! it was; only a manifest seen for the first time is stored as
//! `lookup_failed`.
//!
//! Plates missing from the monitoring account are looked up platform-wide
//! and enrolled when found.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use geocontrol_core::store::LAST_FULL_SYNC_KEY;
use geocontrol_core::{
    Manifest, NotMonitorableReason, ReasonKind, ResyncStatePolicy, Store, UpsertOutcome,
    model::dedup_control_points,
};
use geocontrol_gateways::{
    ControlPointDocument, ManifestDocument, PositionError, PositionGateway, QueryMode,
    RegulatorGateway,
};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{Result, WorkerError};
use crate::guard::JobGuard;

/// Configuration for the manifest synchronizer.
#[derive(Debug, Clone)]
pub struct ManifestSyncConfig {
    /// How often to sync.
    pub poll_interval: Duration,
    /// Maximum age of the last full sync before the next cycle queries everything.
    pub full_sync_every: chrono::Duration,
    /// How a resync treats locally finished manifests.
    pub resync_policy: ResyncStatePolicy,
}

impl Default for ManifestSyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(900), // 15 minutes
            full_sync_every: chrono::Duration::hours(24),
            resync_policy: ResyncStatePolicy::Preserve,
        }
    }
}

/// Counters for one sync cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    /// Query mode used.
    pub mode: Option<QueryMode>,
    /// Documents returned by the regulator.
    pub received: usize,
    /// New manifests.
    pub inserted: usize,
    /// Existing manifests rewritten.
    pub updated: usize,
    /// Manifests classified monitorable.
    pub monitorable: usize,
    /// Manifests classified not monitorable.
    pub not_monitorable: usize,
    /// Manifests whose vehicle is not on the monitoring account.
    pub unassigned: usize,
    /// Repeated control points dropped by deduplication.
    pub duplicates_removed: usize,
    /// Manifests that failed to process.
    pub errors: usize,
}

/// Vehicle authorization and monitorability for one plate.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Classification {
    authorized: bool,
    monitorable: bool,
    reason: Option<NotMonitorableReason>,
}

impl Classification {
    fn monitorable() -> Self {
        Self {
            authorized: true,
            monitorable: true,
            reason: None,
        }
    }

    fn not_monitorable(authorized: bool, kind: ReasonKind, detail: impl Into<String>) -> Self {
        Self {
            authorized,
            monitorable: false,
            reason: Some(NotMonitorableReason::new(kind, detail)),
        }
    }
}

/// Plates on the monitoring account, keyed by plate.
///
/// Enrolled vehicles are added so later manifests in the same cycle skip the
/// platform-wide lookup.
#[derive(Debug, Default)]
struct Fleet {
    vehicles: HashMap<String, i64>,
}

impl Fleet {
    async fn load(position: &dyn PositionGateway) -> Result<Self> {
        let vehicles = position
            .list_authorized_vehicles()
            .await?
            .into_iter()
            .map(|v| (v.plate.to_uppercase(), v.id))
            .collect();
        Ok(Self { vehicles })
    }

    fn contains(&self, plate: &str) -> bool {
        self.vehicles.contains_key(plate)
    }

    fn insert(&mut self, plate: &str, id: i64) {
        self.vehicles.insert(plate.to_string(), id);
    }
}

/// Background job that keeps local manifests in line with the regulator.
pub struct ManifestSynchronizer {
    store: Arc<dyn Store>,
    position: Arc<dyn PositionGateway>,
    regulator: Arc<dyn RegulatorGateway>,
    config: ManifestSyncConfig,
    guard: JobGuard,
    shutdown: Arc<Notify>,
}

impl ManifestSynchronizer {
    /// Create a new synchronizer.
    pub fn new(
        store: Arc<dyn Store>,
        position: Arc<dyn PositionGateway>,
        regulator: Arc<dyn RegulatorGateway>,
        config: ManifestSyncConfig,
    ) -> Self {
        Self {
            store,
            position,
            regulator,
            config,
            guard: JobGuard::new(),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sync loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            resync_policy = ?self.config.resync_policy,
            "Manifest synchronizer started"
        );

        loop {
            if let Err(e) = self.run_once(Utc::now()).await {
                error!(error = %e, "Manifest sync cycle failed");
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Manifest synchronizer received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Manifest synchronizer stopped");
    }

    /// Run one cycle at `now`. Returns `None` when a cycle is already running.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<Option<SyncSummary>> {
        let Some(_permit) = self.guard.try_enter() else {
            debug!("Manifest sync still running, skipping tick");
            return Ok(None);
        };
        self.sync(now).await.map(Some)
    }

    async fn sync(&self, now: DateTime<Utc>) -> Result<SyncSummary> {
        let mode = self.query_mode(now).await?;
        let mut summary = SyncSummary {
            mode: Some(mode),
            ..Default::default()
        };

        let mut fleet = Fleet::load(self.position.as_ref()).await?;
        debug!(vehicles = fleet.vehicles.len(), "Loaded monitoring account");

        let documents = self.regulator.query_manifests(mode).await?;
        summary.received = documents.len();

        if mode == QueryMode::All {
            self.store
                .put_setting(LAST_FULL_SYNC_KEY, &now.to_rfc3339(), now)
                .await?;
        }

        for document in documents {
            let external_id = document.external_id.clone();
            match self.reconcile(document, &mut fleet, now).await {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    summary.errors += 1;
                    error!(manifest = %external_id, error = %e, "Failed to sync manifest");
                }
            }
        }

        info!(
            mode = mode.as_str(),
            received = summary.received,
            inserted = summary.inserted,
            updated = summary.updated,
            monitorable = summary.monitorable,
            not_monitorable = summary.not_monitorable,
            unassigned = summary.unassigned,
            duplicates_removed = summary.duplicates_removed,
            errors = summary.errors,
            "Manifest sync completed"
        );

        Ok(summary)
    }

    /// Query one manifest from the regulator and reconcile it.
    ///
    /// Waits for a running sync cycle to finish first.
    pub async fn refresh(&self, external_id: &str, now: DateTime<Utc>) -> Result<Manifest> {
        let _permit = self.guard.enter().await;

        let document = self
            .regulator
            .query_manifest(external_id)
            .await?
            .ok_or_else(|| WorkerError::not_found("manifest", external_id))?;

        let mut fleet = Fleet::load(self.position.as_ref()).await?;
        let outcome = self.reconcile(document, &mut fleet, now).await?;

        info!(
            manifest = %external_id,
            upsert = ?outcome.upsert,
            monitorable = outcome.manifest.monitorable,
            "Manifest refreshed"
        );
        Ok(outcome.manifest)
    }

    async fn query_mode(&self, now: DateTime<Utc>) -> Result<QueryMode> {
        let last = self.store.get_setting(LAST_FULL_SYNC_KEY).await?;
        let last = last.and_then(|raw| match DateTime::parse_from_rfc3339(&raw) {
            Ok(at) => Some(at.with_timezone(&Utc)),
            Err(e) => {
                warn!(value = %raw, error = %e, "Ignoring unreadable last full sync time");
                None
            }
        });

        Ok(match last {
            Some(at) if now - at < self.config.full_sync_every => QueryMode::New,
            _ => QueryMode::All,
        })
    }

    async fn reconcile(
        &self,
        document: ManifestDocument,
        fleet: &mut Fleet,
        now: DateTime<Utc>,
    ) -> Result<Reconciled> {
        let plate = document.plate.trim().to_uppercase();
        let classification = self.classify(&plate, fleet).await;
        let assigned = fleet.contains(&plate);

        let incoming = document
            .control_points
            .into_iter()
            .map(ControlPointDocument::into_control_point)
            .collect();
        let (points, duplicates_removed) = dedup_control_points(incoming);
        if duplicates_removed > 0 {
            warn!(
                manifest = %document.external_id,
                duplicates_removed,
                "Regulator repeated control points"
            );
        }

        let existing = self
            .store
            .get_manifest_by_external_id(&document.external_id)
            .await?;
        let existed = existing.is_some();
        let mut manifest = match existing {
            Some(mut existing) => {
                existing.number = document.number;
                existing.carrier_tax_id = document.carrier_tax_id;
                existing.plate = plate;
                if document.issued_on.is_some() {
                    existing.issued_on = document.issued_on;
                }
                existing.reactivate(self.config.resync_policy);
                existing
            }
            None => {
                let mut created = Manifest::new(
                    document.external_id,
                    document.number,
                    document.carrier_tax_id,
                    &plate,
                    now,
                );
                created.issued_on = document.issued_on;
                created
            }
        };

        manifest.merge_control_points(points);
        let lookup_failed = match classification {
            Ok(c) => {
                manifest.classify(c.authorized, c.monitorable, c.reason);
                false
            }
            Err(e) if existed => {
                warn!(
                    manifest = %manifest.external_id,
                    plate = %manifest.plate,
                    monitorable = manifest.monitorable,
                    error = %e,
                    "Vehicle lookup failed, keeping previous classification"
                );
                true
            }
            Err(e) => {
                warn!(plate = %manifest.plate, error = %e, "Vehicle lookup failed");
                manifest.classify(
                    assigned,
                    false,
                    Some(NotMonitorableReason::new(
                        ReasonKind::LookupFailed,
                        format!("vehicle lookup failed: {e}"),
                    )),
                );
                true
            }
        };
        manifest.updated_at = now;

        let upsert = self.store.save_manifest(&manifest).await?;
        debug!(
            manifest = %manifest.external_id,
            plate = %manifest.plate,
            upsert = ?upsert,
            monitorable = manifest.monitorable,
            points = manifest.control_points.len(),
            "Manifest saved"
        );

        Ok(Reconciled {
            upsert,
            manifest,
            duplicates_removed,
            lookup_failed,
        })
    }

    /// Work out authorization and monitorability for `plate`.
    ///
    /// Fails only when the platform lookup itself fails; an enrollment
    /// failure is a classification.
    async fn classify(
        &self,
        plate: &str,
        fleet: &mut Fleet,
    ) -> std::result::Result<Classification, PositionError> {
        let detail = self.position.vehicle_detail_by_plate(plate).await?;

        if fleet.contains(plate) {
            return Ok(match detail {
                Some(d) if d.monitored => Classification::monitorable(),
                Some(_) => Classification::not_monitorable(
                    true,
                    ReasonKind::NotTracked,
                    "vehicle assigned but not monitored",
                ),
                None => Classification::not_monitorable(
                    true,
                    ReasonKind::NotTracked,
                    "vehicle assigned but missing from platform lookup",
                ),
            });
        }

        let Some(detail) = detail else {
            return Ok(Classification {
                authorized: false,
                monitorable: false,
                reason: Some(NotMonitorableReason::not_registered()),
            });
        };

        Ok(match self.position.authorize_vehicle(detail.id).await {
            Ok(enrollment) => {
                info!(plate = %plate, vehicle_id = detail.id, enrollment = ?enrollment, "Vehicle enrolled");
                fleet.insert(plate, detail.id);
                if detail.monitored {
                    Classification::monitorable()
                } else {
                    Classification::not_monitorable(
                        true,
                        ReasonKind::NotTracked,
                        "vehicle exists but is not monitored",
                    )
                }
            }
            Err(e) => {
                warn!(plate = %plate, vehicle_id = detail.id, error = %e, "Vehicle enrollment failed");
                Classification::not_monitorable(
                    false,
                    ReasonKind::EnrollmentFailed,
                    format!("auto-enrollment failed: {e}"),
                )
            }
        })
    }
}

struct Reconciled {
    upsert: UpsertOutcome,
    manifest: Manifest,
    duplicates_removed: usize,
    lookup_failed: bool,
}

impl SyncSummary {
    fn record(&mut self, outcome: &Reconciled) {
        match outcome.upsert {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
        }
        if outcome.manifest.monitorable {
            self.monitorable += 1;
        } else {
            self.not_monitorable += 1;
        }
        if !outcome.manifest.vehicle_authorized {
            self.unassigned += 1;
        }
        self.duplicates_removed += outcome.duplicates_removed;
        if outcome.lookup_failed {
            self.errors += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ManifestSyncConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(900));
        assert_eq!(config.full_sync_every, chrono::Duration::hours(24));
        assert_eq!(config.resync_policy, ResyncStatePolicy::Preserve);
    }

    #[test]
    fn test_fleet_tracks_enrolled_plates() {
        let mut fleet = Fleet::default();
        assert!(!fleet.contains("ABC123"));
        fleet.insert("ABC123", 10);
        assert!(fleet.contains("ABC123"));
    }
}
