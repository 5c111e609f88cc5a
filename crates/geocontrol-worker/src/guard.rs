// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Non-reentrant job guard.
//!
//! A scheduled tick that finds its job still running is skipped, not queued.

use tokio::sync::{Mutex, MutexGuard};

/// Marks one job as running.
#[derive(Debug, Default)]
pub struct JobGuard {
    running: Mutex<()>,
}

/// Held for the duration of one job run.
pub type JobPermit<'a> = MutexGuard<'a, ()>;

impl JobGuard {
    /// Create an idle guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the job, or `None` if a run is already in progress.
    pub fn try_enter(&self) -> Option<JobPermit<'_>> {
        self.running.try_lock().ok()
    }

    /// Enter the job, waiting for a run in progress to finish.
    ///
    /// Used by operator actions that must not interleave with a scheduled run.
    pub async fn enter(&self) -> JobPermit<'_> {
        self.running.lock().await
    }

    /// Whether a run is in progress.
    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }
}
