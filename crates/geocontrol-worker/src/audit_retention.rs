// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Audit log retention.
//!
//! Deletes regulator interaction records older than the retention period.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use geocontrol_core::Store;
use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::dispatcher::cutoff;
use crate::error::Result;
use crate::guard::JobGuard;

/// Configuration for the audit retention job.
#[derive(Debug, Clone)]
pub struct AuditRetentionConfig {
    /// How often to purge.
    pub poll_interval: Duration,
    /// Age after which interaction records are deleted.
    pub retention: Duration,
}

impl Default for AuditRetentionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 3600), // 7 days
        }
    }
}

/// Background job that purges old interaction records.
pub struct AuditRetention {
    store: Arc<dyn Store>,
    config: AuditRetentionConfig,
    guard: JobGuard,
    shutdown: Arc<Notify>,
}

impl AuditRetention {
    /// Create a new retention job.
    pub fn new(store: Arc<dyn Store>, config: AuditRetentionConfig) -> Self {
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

    /// Run the purge loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "Audit retention started"
        );

        loop {
            if let Err(e) = self.run_once(Utc::now()).await {
                error!(error = %e, "Audit purge failed");
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Audit retention received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Audit retention stopped");
    }

    /// Purge records older than the retention period as of `now`.
    ///
    /// Returns the number of records deleted, or `None` when a purge is
    /// already running.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<Option<u64>> {
        let Some(_permit) = self.guard.try_enter() else {
            debug!("Audit purge still running, skipping tick");
            return Ok(None);
        };

        let older_than = cutoff(now, self.config.retention);
        let purged = self.store.purge_interactions(older_than).await?;
        if purged > 0 {
            info!(purged, older_than = %older_than, "Purged regulator interactions");
        } else {
            debug!(older_than = %older_than, "No regulator interactions to purge");
        }
        Ok(Some(purged))
    }
}
