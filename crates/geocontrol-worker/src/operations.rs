// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator operations and read access.
//!
//! [`Operations`] is the surface an admin tool or API layer calls into:
//! retrying stuck submissions, annulling an accepted report, refreshing one
//! manifest from the regulator, and reading records and counters.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use geocontrol_core::{
    ExceptionReport, InteractionFilter, Manifest, ManifestCounts, Page, PlateCounts,
    RegulatorInteraction, Report, StateCounts, Store, SubmissionState,
};
use geocontrol_gateways::{AnnulSubmission, RegulatorGateway};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, WorkerError};
use crate::sync::ManifestSynchronizer;

/// Operator-facing operations over the pipeline state.
#[derive(Clone)]
pub struct Operations {
    store: Arc<dyn Store>,
    regulator: Arc<dyn RegulatorGateway>,
    synchronizer: Arc<ManifestSynchronizer>,
}

impl Operations {
    /// Create operations backed by `store`, `regulator` and the running
    /// synchronizer.
    pub fn new(
        store: Arc<dyn Store>,
        regulator: Arc<dyn RegulatorGateway>,
        synchronizer: Arc<ManifestSynchronizer>,
    ) -> Self {
        Self {
            store,
            regulator,
            synchronizer,
        }
    }

    /// Put a report back in the queue with a fresh attempt budget.
    ///
    /// Only `error` and `pending` reports whose deadline has not passed can be
    /// retried.
    pub async fn retry_report(&self, id: Uuid, now: DateTime<Utc>) -> Result<Report> {
        let mut report = self.report(id).await?;
        report.reset_for_retry(now)?;
        self.store.update_report(&report).await?;

        info!(report_id = %id, deadline = %report.deadline, "Report reset for retry");
        Ok(report)
    }

    /// Put an exception report back in the queue with a fresh attempt budget.
    pub async fn retry_exception(&self, id: Uuid, now: DateTime<Utc>) -> Result<ExceptionReport> {
        let mut exception = self.exception(id).await?;
        exception.reset_for_retry(now)?;
        self.store.update_exception(&exception).await?;

        info!(exception_id = %id, deadline = %exception.deadline, "Exception report reset for retry");
        Ok(exception)
    }

    /// Annul an accepted report at the regulator.
    ///
    /// On success the report becomes `annulled`, which frees its control
    /// point for a new report, and the point's confirmation id is cleared.
    /// A regulator failure leaves the report untouched.
    pub async fn annul_report(
        &self,
        id: Uuid,
        observations: &str,
        now: DateTime<Utc>,
    ) -> Result<Report> {
        let mut report = self.report(id).await?;

        let confirmation_id = match (&report.state, &report.confirmation_id) {
            (SubmissionState::Reported, Some(confirmation_id)) => confirmation_id.clone(),
            (SubmissionState::Reported, None) => {
                return Err(WorkerError::InvalidOperation(format!(
                    "report {id} has no confirmation id"
                )));
            }
            (state, _) => {
                return Err(WorkerError::InvalidOperation(format!(
                    "report {id} is {} and cannot be annulled",
                    state.as_str()
                )));
            }
        };

        let submission = AnnulSubmission {
            confirmation_id: confirmation_id.clone(),
            manifest_external_id: report.manifest_external_id.clone(),
            plate: report.plate.clone(),
            point_code: report.point_code,
            observations: observations.to_string(),
        };
        let annulment_id = self
            .regulator
            .annul_report(&submission)
            .await
            .inspect_err(|e| warn!(report_id = %id, error = %e, "Annulment rejected"))?;

        report.annul(now)?;
        self.store.update_report(&report).await?;
        self.store
            .set_control_point_confirmation(report.control_point_id, None)
            .await?;

        info!(
            report_id = %id,
            confirmation_id = %confirmation_id,
            annulment_id = %annulment_id,
            "Report annulled"
        );
        Ok(report)
    }

    /// Query one manifest from the regulator and reconcile it now.
    pub async fn refresh_manifest(&self, external_id: &str, now: DateTime<Utc>) -> Result<Manifest> {
        self.synchronizer.refresh(external_id, now).await
    }

    /// Manifest by external id.
    pub async fn manifest(&self, external_id: &str) -> Result<Manifest> {
        self.store
            .get_manifest_by_external_id(external_id)
            .await?
            .ok_or_else(|| WorkerError::not_found("manifest", external_id))
    }

    /// Report by id.
    pub async fn report(&self, id: Uuid) -> Result<Report> {
        self.store
            .get_report(id)
            .await?
            .ok_or_else(|| WorkerError::not_found("report", id))
    }

    /// Exception report by id.
    pub async fn exception(&self, id: Uuid) -> Result<ExceptionReport> {
        self.store
            .get_exception(id)
            .await?
            .ok_or_else(|| WorkerError::not_found("exception report", id))
    }

    /// Report counts by state, optionally for one plate.
    pub async fn report_counts(&self, plate: Option<&str>) -> Result<StateCounts> {
        Ok(self.store.report_counts(plate).await?)
    }

    /// Exception report counts by state, optionally for one plate.
    pub async fn exception_counts(&self, plate: Option<&str>) -> Result<StateCounts> {
        Ok(self.store.exception_counts(plate).await?)
    }

    /// Report counts per plate.
    pub async fn report_counts_by_plate(&self, page: Page) -> Result<Vec<PlateCounts>> {
        Ok(self.store.report_counts_by_plate(page).await?)
    }

    /// Manifest totals.
    pub async fn manifest_counts(&self) -> Result<ManifestCounts> {
        Ok(self.store.manifest_counts().await?)
    }

    /// Regulator interactions, most recent first.
    pub async fn interactions(&self, filter: &InteractionFilter) -> Result<Vec<RegulatorInteraction>> {
        Ok(self.store.list_interactions(filter).await?)
    }
}
