// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Freight-manifest regulator gateway.

pub mod client;
pub mod datetime;
pub mod decode;
pub mod envelope;
pub mod payload;

use async_trait::async_trait;

use crate::error::RegulatorError;

pub use client::{DEFAULT_ENDPOINT, MIN_TIMEOUT, RegulatorClient, RegulatorConfig};
pub use datetime::RegulatorClock;
pub use decode::Reply;
pub use payload::{
    AnnulSubmission, ControlPointDocument, ExceptionSubmission, ManifestDocument, QueryMode,
    ReportSubmission,
};

/// Operations the pipeline needs from the regulator.
///
/// Submissions return the regulator's confirmation id.
#[async_trait]
pub trait RegulatorGateway: Send + Sync {
    /// Manifests assigned to the carrier's GPS provider.
    async fn query_manifests(&self, mode: QueryMode)
    -> Result<Vec<ManifestDocument>, RegulatorError>;

    /// One manifest by regulator id; `None` when the regulator returns none.
    async fn query_manifest(
        &self,
        external_id: &str,
    ) -> Result<Option<ManifestDocument>, RegulatorError>;

    /// Submit an arrival/departure report.
    async fn submit_report(&self, submission: &ReportSubmission) -> Result<String, RegulatorError>;

    /// Submit an exception report.
    async fn submit_exception(
        &self,
        submission: &ExceptionSubmission,
    ) -> Result<String, RegulatorError>;

    /// Annul a previously accepted report.
    async fn annul_report(&self, submission: &AnnulSubmission) -> Result<String, RegulatorError>;
}
