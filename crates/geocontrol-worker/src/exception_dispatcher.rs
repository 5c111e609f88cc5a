// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exception report dispatcher.
//!
//! Same cycle as the report dispatcher with two differences: a record is only
//! sent while its appointment is 24 to 36 hours in the past, and the
//! confirmation stays on the exception report rather than the control point.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use geocontrol_core::schedule::MAX_ATTEMPTS;
use geocontrol_core::{ExceptionReport, Store, SubmissionOutcome, SubmissionState};
use geocontrol_gateways::{ExceptionSubmission, RegulatorGateway};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DispatchSummary, Dispatched, cutoff};
use crate::error::Result;
use crate::guard::JobGuard;

/// Configuration for the exception dispatcher.
#[derive(Debug, Clone)]
pub struct ExceptionDispatcherConfig {
    /// How often to drain the queue.
    pub poll_interval: Duration,
    /// Maximum exception reports submitted per cycle.
    pub batch_size: i64,
    /// Attempts before a record is left for the overdue sweep.
    pub max_attempts: i32,
    /// Time in `sending` after which an attempt is considered interrupted.
    pub stale_after: Duration,
}

impl Default for ExceptionDispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(900), // 15 minutes
            batch_size: 20,
            max_attempts: MAX_ATTEMPTS,
            stale_after: Duration::from_secs(600),
        }
    }
}

/// Background job that submits exception reports.
pub struct ExceptionDispatcher {
    store: Arc<dyn Store>,
    regulator: Arc<dyn RegulatorGateway>,
    config: ExceptionDispatcherConfig,
    guard: JobGuard,
    shutdown: Arc<Notify>,
}

impl ExceptionDispatcher {
    /// Create a new dispatcher.
    pub fn new(
        store: Arc<dyn Store>,
        regulator: Arc<dyn RegulatorGateway>,
        config: ExceptionDispatcherConfig,
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
            "Exception dispatcher started"
        );

        loop {
            if let Err(e) = self.run_once(Utc::now()).await {
                error!(error = %e, "Exception dispatch cycle failed");
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Exception dispatcher received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Exception dispatcher stopped");
    }

    /// Run one cycle at `now`. Returns `None` when a cycle is already running.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<Option<DispatchSummary>> {
        let Some(_permit) = self.guard.try_enter() else {
            debug!("Exception dispatcher still running, skipping tick");
            return Ok(None);
        };
        self.dispatch_batch(now).await.map(Some)
    }

    async fn dispatch_batch(&self, now: DateTime<Utc>) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary {
            recovered: self
                .store
                .recover_stale_exceptions(cutoff(now, self.config.stale_after), now)
                .await?,
            ..Default::default()
        };
        if summary.recovered > 0 {
            warn!(recovered = summary.recovered, "Recovered interrupted exception submissions");
        }

        let batch = self
            .store
            .list_dispatchable_exceptions(now, self.config.max_attempts, self.config.batch_size)
            .await?;
        summary.selected = batch.len();

        for exception in batch {
            let exception_id = exception.id;
            match self.dispatch(exception, now).await {
                Ok(dispatched) => summary.record(dispatched),
                Err(e) => {
                    summary.errors += 1;
                    error!(exception_id = %exception_id, error = %e, "Failed to dispatch exception report");
                }
            }
        }

        summary.overdue = self.store.mark_overdue_exceptions(now).await?;
        if summary.overdue > 0 {
            warn!(overdue = summary.overdue, "Exception reports marked as overdue");
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
                "Exception dispatch completed"
            );
        }

        Ok(summary)
    }

    async fn dispatch(&self, mut exception: ExceptionReport, now: DateTime<Utc>) -> Result<Dispatched> {
        if let Some(report) = self
            .store
            .find_report_for_point(exception.manifest_id, exception.control_point_id)
            .await?
            && report.state == SubmissionState::Reported
        {
            exception.supersede(now)?;
            self.store.update_exception(&exception).await?;
            info!(
                exception_id = %exception.id,
                manifest = %exception.manifest_external_id,
                point_code = exception.point_code,
                "Exception report superseded by accepted report"
            );
            return Ok(Dispatched::Superseded);
        }

        if !exception.window_open(now) {
            debug!(
                exception_id = %exception.id,
                appointment = %exception.appointment,
                "Exception report out of window"
            );
            return Ok(Dispatched::Deferred);
        }

        if !self.store.claim_exception(exception.id, now).await? {
            debug!(exception_id = %exception.id, "Exception report no longer claimable");
            return Ok(Dispatched::Deferred);
        }
        let attempt = exception.attempts + 1;

        info!(
            exception_id = %exception.id,
            manifest = %exception.manifest_external_id,
            plate = %exception.plate,
            point_code = exception.point_code,
            code = exception.code.code(),
            attempt,
            "Submitting exception report"
        );

        let submission = ExceptionSubmission::from_exception(&exception);
        match self.regulator.submit_exception(&submission).await {
            Ok(confirmation_id) => {
                let outcome = SubmissionOutcome::Accepted {
                    confirmation_id: confirmation_id.clone(),
                };
                self.store
                    .finish_exception(exception.id, &outcome, now)
                    .await?;
                info!(
                    exception_id = %exception.id,
                    confirmation_id = %confirmation_id,
                    "Exception report accepted"
                );
                Ok(Dispatched::Reported)
            }
            Err(e) => {
                let outcome = SubmissionOutcome::Failed {
                    error: e.to_string(),
                };
                self.store
                    .finish_exception(exception.id, &outcome, now)
                    .await?;
                warn!(
                    exception_id = %exception.id,
                    attempt,
                    max_attempts = self.config.max_attempts,
                    error = %e,
                    "Exception report submission failed"
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
        let config = ExceptionDispatcherConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(900));
        assert_eq!(config.batch_size, 20);
        assert_eq!(config.max_attempts, 3);
    }
}
