// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Report dispatcher.
//!
//! Drains the arrival/departure report queue into the regulator.
//!
//! Each cycle:
//! 1. Returns reports stuck in `sending` past `stale_after` to `error`
//! 2. Selects up to `batch_size` pending or errored reports with budget and
//!    time left, earliest deadline first
//! 3. Claims and submits each one; a missing departure is estimated
//! 4. Marks reports whose deadline passed as `overdue`

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use geocontrol_core::schedule::MAX_ATTEMPTS;
use geocontrol_core::{Departure, Report, Store, SubmissionOutcome, SubmissionState};
use geocontrol_gateways::{RegulatorGateway, ReportSubmission};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::guard::JobGuard;

/// Configuration for the report dispatcher.
#[derive(Debug, Clone)]
pub struct ReportDispatcherConfig {
    /// How often to drain the queue.
    pub poll_interval: Duration,
    /// Maximum reports submitted per cycle.
    pub batch_size: i64,
    /// Attempts before a report is left for the overdue sweep.
    pub max_attempts: i32,
    /// Time in `sending` after which an attempt is considered interrupted.
    pub stale_after: Duration,
}

impl Default for ReportDispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 20,
            max_attempts: MAX_ATTEMPTS,
            stale_after: Duration::from_secs(600), // 10 minutes
        }
    }
}

/// Counters for one dispatch cycle, shared by both dispatchers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    /// Records selected for this cycle.
    pub selected: usize,
    /// Accepted by the regulator.
    pub reported: usize,
    /// Rejected or failed in transit.
    pub failed: usize,
    /// Closed because the counterpart submission was accepted.
    pub superseded: usize,
    /// Left for a later cycle (claimed elsewhere, or outside the submission window).
    pub deferred: usize,
    /// Moved past their deadline.
    pub overdue: u64,
    /// Returned from an interrupted `sending`.
    pub recovered: u64,
    /// Records that failed to process.
    pub errors: usize,
}

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatched {
    Reported,
    Failed,
    Superseded,
    Deferred,
}

impl DispatchSummary {
    pub(crate) fn record(&mut self, dispatched: Dispatched) {
        match dispatched {
            Dispatched::Reported => self.reported += 1,
            Dispatched::Failed => self.failed += 1,
            Dispatched::Superseded => self.superseded += 1,
            Dispatched::Deferred => self.deferred += 1,
        }
    }
}

/// `now` minus `age`, clamped to the earliest representable time.
pub(crate) fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Background job that submits arrival/departure reports.
pub struct ReportDispatcher {
    store: Arc<dyn Store>,
    regulator: Arc<dyn RegulatorGateway>,
    config: ReportDispatcherConfig,
    guard: JobGuard,
    shutdown: Arc<Notify>,
}

impl ReportDispatcher {
    /// Create a new dispatcher.
    pub fn new(
        store: Arc<dyn Store>,
        regulator: Arc<dyn RegulatorGateway>,
        config: ReportDispatcherConfig,
    ) -> Self {
        Self {
            store,
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

    /// Run the dispatch loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            max_attempts = self.config.max_attempts,
            "Report dispatcher started"
        );

        loop {
            if let Err(e) = self.run_once(Utc::now()).await {
                error!(error = %e, "Report dispatch cycle failed");
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Report dispatcher received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Report dispatcher stopped");
    }

    /// Run one cycle at `now`. Returns `None` when a cycle is already running.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<Option<DispatchSummary>> {
        let Some(_permit) = self.guard.try_enter() else {
            debug!("Report dispatcher still running, skipping tick");
            return Ok(None);
        };
        self.dispatch_batch(now).await.map(Some)
    }

    async fn dispatch_batch(&self, now: DateTime<Utc>) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary {
            recovered: self
                .store
                .recover_stale_reports(cutoff(now, self.config.stale_after), now)
                .await?,
            ..Default::default()
        };
        if summary.recovered > 0 {
            warn!(recovered = summary.recovered, "Recovered interrupted report submissions");
        }

        let batch = self
            .store
            .list_dispatchable_reports(now, self.config.max_attempts, self.config.batch_size)
            .await?;
        summary.selected = batch.len();

        for report in batch {
            let report_id = report.id;
            match self.dispatch(report, now).await {
                Ok(dispatched) => summary.record(dispatched),
                Err(e) => {
                    summary.errors += 1;
                    error!(report_id = %report_id, error = %e, "Failed to dispatch report");
                }
            }
        }

        summary.overdue = self.store.mark_overdue_reports(now).await?;
        if summary.overdue > 0 {
            warn!(overdue = summary.overdue, "Reports marked as overdue");
        }

        if summary.selected > 0 || summary.overdue > 0 {
            info!(
                selected = summary.selected,
                reported = summary.reported,
                failed = summary.failed,
                superseded = summary.superseded,
                deferred = summary.deferred,
                overdue = summary.overdue,
                errors = summary.errors,
                "Report dispatch completed"
            );
        }

        Ok(summary)
    }

    async fn dispatch(&self, mut report: Report, now: DateTime<Utc>) -> Result<Dispatched> {
        if let Some(exception) = self
            .store
            .find_exception_for_point(report.manifest_id, report.control_point_id)
            .await?
            && exception.state == SubmissionState::Reported
        {
            report.supersede(now)?;
            self.store.update_report(&report).await?;
            info!(
                report_id = %report.id,
                manifest = %report.manifest_external_id,
                point_code = report.point_code,
                "Report superseded by accepted exception report"
            );
            return Ok(Dispatched::Superseded);
        }

        if !self.store.claim_report(report.id, now).await? {
            debug!(report_id = %report.id, "Report no longer claimable");
            return Ok(Dispatched::Deferred);
        }
        let attempt = report.attempts + 1;

        let submission = ReportSubmission::from_report(&report);
        let estimated = match submission.departure {
            Departure::Estimated(fix) => Some(fix),
            Departure::Observed(_) | Departure::NotObserved => None,
        };

        info!(
            report_id = %report.id,
            manifest = %report.manifest_external_id,
            plate = %report.plate,
            point_code = report.point_code,
            attempt,
            estimated_departure = estimated.is_some(),
            "Submitting report"
        );

        match self.regulator.submit_report(&submission).await {
            Ok(confirmation_id) => {
                let outcome = SubmissionOutcome::Accepted {
                    confirmation_id: confirmation_id.clone(),
                };
                let applied = self
                    .store
                    .finish_report(report.id, &outcome, estimated, now)
                    .await?;
                self.store
                    .set_control_point_confirmation(report.control_point_id, Some(&confirmation_id))
                    .await?;

                if applied {
                    info!(
                        report_id = %report.id,
                        confirmation_id = %confirmation_id,
                        "Report accepted"
                    );
                } else {
                    // A departure reopened the report mid-send; it goes out again.
                    info!(
                        report_id = %report.id,
                        confirmation_id = %confirmation_id,
                        "Report accepted but changed while sending, resubmission queued"
                    );
                }
                Ok(Dispatched::Reported)
            }
            Err(e) => {
                let outcome = SubmissionOutcome::Failed {
                    error: e.to_string(),
                };
                self.store
                    .finish_report(report.id, &outcome, None, now)
                    .await?;
                warn!(
                    report_id = %report.id,
                    attempt,
                    max_attempts = self.config.max_attempts,
                    error = %e,
                    "Report submission failed"
                );
                Ok(Dispatched::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ReportDispatcherConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.stale_after, Duration::from_secs(600));
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = DispatchSummary::default();
        summary.record(Dispatched::Reported);
        summary.record(Dispatched::Reported);
        summary.record(Dispatched::Failed);
        summary.record(Dispatched::Deferred);

        assert_eq!(summary.reported, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.superseded, 0);
    }

    #[test]
    fn test_cutoff() {
        let now = Utc::now();
        assert_eq!(
            cutoff(now, Duration::from_secs(600)),
            now - chrono::Duration::minutes(10)
        );
        assert_eq!(cutoff(now, Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }
}
