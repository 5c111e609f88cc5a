// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interface and backends.
//!
//! The store is the only shared mutable state of the pipeline. Every write
//! is committed individually; a manifest and its control points are written
//! together in one transaction.
//!
//! | Backend | Use |
//! |---------|-----|
//! | [`PostgresStore`] | production |
//! | [`SqliteStore`] | embedded deployments and tests |

pub mod postgres;
pub mod sqlite;

mod rows;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::audit::{InteractionFilter, RegulatorInteraction};
use crate::error::{Result, StoreError};
use crate::model::{ControlPoint, ExceptionReport, Fix, Manifest, Report};
use crate::state::ManifestState;
use crate::stats::{ManifestCounts, Page, PlateCounts, StateCounts};

/// Settings key holding the RFC 3339 time of the last successful full sync.
pub const LAST_FULL_SYNC_KEY: &str = "manifest_sync.last_full_sync";

/// Whether [`Store::save_manifest`] created or replaced the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New row.
    Inserted,
    /// Existing row overwritten.
    Updated,
}

/// Result of one submission attempt, written back by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmissionOutcome {
    /// The regulator accepted the submission.
    Accepted {
        /// Regulator-assigned confirmation id.
        confirmation_id: String,
    },
    /// The attempt failed.
    Failed {
        /// Error message kept on the record.
        error: String,
    },
}

/// Persistence operations used by the pipeline.
#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Read a setting.
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    /// Create or overwrite a setting.
    async fn put_setting(&self, key: &str, value: &str, now: DateTime<Utc>) -> Result<()>;

    // ------------------------------------------------------------------
    // Manifests
    // ------------------------------------------------------------------

    /// Load a manifest with its control points.
    async fn get_manifest(&self, id: Uuid) -> Result<Option<Manifest>>;

    /// Load a manifest by regulator id.
    async fn get_manifest_by_external_id(&self, external_id: &str) -> Result<Option<Manifest>>;

    /// Insert or overwrite a manifest and replace its control points.
    ///
    /// Points are matched by id; stored points missing from `manifest` are deleted.
    /// The confirmation id of an existing point is left as stored; it is only
    /// written by [`Store::set_control_point_confirmation`].
    async fn save_manifest(&self, manifest: &Manifest) -> Result<UpsertOutcome>;

    /// Active manifests flagged monitorable.
    async fn list_monitorable_manifests(&self) -> Result<Vec<Manifest>>;

    /// Active, non-monitorable manifests whose plate is unknown to the telemetry platform.
    async fn list_unregistered_manifests(&self) -> Result<Vec<Manifest>>;

    /// Write (or clear) the regulator confirmation on a control point.
    async fn set_control_point_confirmation(
        &self,
        control_point_id: Uuid,
        confirmation_id: Option<&str>,
    ) -> Result<()>;

    /// Write the tracking columns of `points` (state, detections, no-departure
    /// flag, report link) and, when given, the manifest's lifecycle state.
    ///
    /// Feed attributes, classification and confirmation ids stay as stored.
    async fn save_tracking(
        &self,
        manifest_id: Uuid,
        state: Option<ManifestState>,
        points: &[ControlPoint],
        now: DateTime<Utc>,
    ) -> Result<()>;

    // ------------------------------------------------------------------
    // Reports
    // ------------------------------------------------------------------

    /// Insert a report. Fails with [`StoreError::Conflict`] if the point
    /// already has a non-annulled report.
    async fn insert_report(&self, report: &Report) -> Result<()>;

    /// Load a report.
    async fn get_report(&self, id: Uuid) -> Result<Option<Report>>;

    /// The non-annulled report for a control point, if any.
    async fn find_report_for_point(
        &self,
        manifest_id: Uuid,
        control_point_id: Uuid,
    ) -> Result<Option<Report>>;

    /// Overwrite every mutable column of a report.
    async fn update_report(&self, report: &Report) -> Result<()>;

    /// Pending or errored reports with deadline after `now` and fewer than
    /// `max_attempts` attempts, earliest deadline first.
    async fn list_dispatchable_reports(
        &self,
        now: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<Report>>;

    /// Move a pending/errored report to `sending`, bumping the attempt counter.
    ///
    /// Returns `false` when the report was no longer claimable.
    async fn claim_report(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Record the outcome of the attempt started by [`Store::claim_report`].
    ///
    /// Applies only while the report is still `sending`; returns `false` when
    /// the report was changed in the meantime (e.g. reopened by a departure).
    /// `estimated_departure` is stored, flagged estimated, on acceptance.
    async fn finish_report(
        &self,
        id: Uuid,
        outcome: &SubmissionOutcome,
        estimated_departure: Option<Fix>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Move pending/errored reports whose deadline passed to `overdue`.
    async fn mark_overdue_reports(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Move reports stuck in `sending` since before `cutoff` back to `error`.
    async fn recover_stale_reports(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>)
    -> Result<u64>;

    // ------------------------------------------------------------------
    // Exception reports
    // ------------------------------------------------------------------

    /// Insert an exception report. Fails with [`StoreError::Conflict`] if the
    /// point already has one.
    async fn insert_exception(&self, exception: &ExceptionReport) -> Result<()>;

    /// Load an exception report.
    async fn get_exception(&self, id: Uuid) -> Result<Option<ExceptionReport>>;

    /// The exception report for a control point, if any.
    async fn find_exception_for_point(
        &self,
        manifest_id: Uuid,
        control_point_id: Uuid,
    ) -> Result<Option<ExceptionReport>>;

    /// Overwrite every mutable column of an exception report.
    async fn update_exception(&self, exception: &ExceptionReport) -> Result<()>;

    /// Same selection rule as [`Store::list_dispatchable_reports`].
    async fn list_dispatchable_exceptions(
        &self,
        now: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<ExceptionReport>>;

    /// Same contract as [`Store::claim_report`].
    async fn claim_exception(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Same contract as [`Store::finish_report`].
    async fn finish_exception(
        &self,
        id: Uuid,
        outcome: &SubmissionOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Move pending/errored exception reports whose deadline passed to `overdue`.
    async fn mark_overdue_exceptions(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Move exception reports stuck in `sending` since before `cutoff` back to `error`.
    async fn recover_stale_exceptions(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    // ------------------------------------------------------------------
    // Interaction audit log
    // ------------------------------------------------------------------

    /// Append an interaction record.
    async fn record_interaction(&self, interaction: &RegulatorInteraction) -> Result<()>;

    /// Most recent interactions first.
    async fn list_interactions(
        &self,
        filter: &InteractionFilter,
    ) -> Result<Vec<RegulatorInteraction>>;

    /// Delete interactions that occurred before `older_than`.
    async fn purge_interactions(&self, older_than: DateTime<Utc>) -> Result<u64>;

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Report counts by state, optionally for one plate.
    async fn report_counts(&self, plate: Option<&str>) -> Result<StateCounts>;

    /// Exception report counts by state, optionally for one plate.
    async fn exception_counts(&self, plate: Option<&str>) -> Result<StateCounts>;

    /// Report counts per plate, ordered by plate.
    async fn report_counts_by_plate(&self, page: Page) -> Result<Vec<PlateCounts>>;

    /// Manifest totals and not-monitorable breakdown.
    async fn manifest_counts(&self) -> Result<ManifestCounts>;
}

/// Connect to the store named by `url` and apply migrations.
///
/// `sqlite:` URLs open a [`SqliteStore`]; `postgres://` and `postgresql://`
/// open a [`PostgresStore`].
pub async fn connect(url: &str) -> Result<Arc<dyn Store>> {
    if url.starts_with("sqlite:") {
        let store = SqliteStore::connect(url).await?;
        debug!(backend = "sqlite", url = %redact(url), "Store connected, migrations applied");
        Ok(Arc::new(store))
    } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let store = PostgresStore::connect(url).await?;
        debug!(backend = "postgres", url = %redact(url), "Store connected, migrations applied");
        Ok(Arc::new(store))
    } else {
        Err(StoreError::UnsupportedUrl(redact(url)))
    }
}

fn redact(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, _)) => format!("{scheme}://…"),
        None => url.chars().take(16).collect(),
    }
}

/// Fold `(plate, state, count)` rows, ordered by plate, into per-plate counts.
pub(crate) fn fold_plate_counts(rows: Vec<(String, String, i64)>) -> Result<Vec<PlateCounts>> {
    let mut grouped: Vec<(String, Vec<(String, i64)>)> = Vec::new();
    for (plate, state, n) in rows {
        match grouped.last_mut() {
            Some((last, states)) if *last == plate => states.push((state, n)),
            _ => grouped.push((plate, vec![(state, n)])),
        }
    }
    grouped
        .into_iter()
        .map(|(plate, states)| {
            Ok(PlateCounts {
                plate,
                counts: StateCounts::from_rows(states)?,
            })
        })
        .collect()
}
