// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Read-side counters for dashboards.

use serde::Serialize;

use crate::error::{Result, StoreError};
use crate::model::ReasonKind;
use crate::state::SubmissionState;

/// Submission counts by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    /// `pending`
    pub pending: i64,
    /// `sending`
    pub sending: i64,
    /// `reported`
    pub reported: i64,
    /// `overdue`
    pub overdue: i64,
    /// `error`
    pub error: i64,
    /// `annulled`
    pub annulled: i64,
    /// `superseded`
    pub superseded: i64,
}

impl StateCounts {
    /// Build from `(state, count)` rows.
    pub fn from_rows(rows: impl IntoIterator<Item = (String, i64)>) -> Result<Self> {
        let mut counts = Self::default();
        for (state, n) in rows {
            let state: SubmissionState = state
                .parse()
                .map_err(|e| StoreError::corrupt("submission", format!("{e}")))?;
            *counts.slot(state) += n;
        }
        Ok(counts)
    }

    fn slot(&mut self, state: SubmissionState) -> &mut i64 {
        match state {
            SubmissionState::Pending => &mut self.pending,
            SubmissionState::Sending => &mut self.sending,
            SubmissionState::Reported => &mut self.reported,
            SubmissionState::Overdue => &mut self.overdue,
            SubmissionState::Error => &mut self.error,
            SubmissionState::Annulled => &mut self.annulled,
            SubmissionState::Superseded => &mut self.superseded,
        }
    }

    /// Count for one state.
    pub fn get(&self, state: SubmissionState) -> i64 {
        match state {
            SubmissionState::Pending => self.pending,
            SubmissionState::Sending => self.sending,
            SubmissionState::Reported => self.reported,
            SubmissionState::Overdue => self.overdue,
            SubmissionState::Error => self.error,
            SubmissionState::Annulled => self.annulled,
            SubmissionState::Superseded => self.superseded,
        }
    }

    /// Sum of all states.
    pub fn total(&self) -> i64 {
        self.pending
            + self.sending
            + self.reported
            + self.overdue
            + self.error
            + self.annulled
            + self.superseded
    }
}

/// Report counts for one plate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlateCounts {
    /// Vehicle plate.
    pub plate: String,
    /// Counts by state.
    pub counts: StateCounts,
}

/// Manifest counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManifestCounts {
    /// All manifests.
    pub total: i64,
    /// `active`
    pub active: i64,
    /// `completed`
    pub completed: i64,
    /// `annulled`
    pub annulled: i64,
    /// Monitorable, any state.
    pub monitorable: i64,
    /// Not monitorable, any state.
    pub not_monitorable: i64,
    /// Not-monitorable breakdown by reason, largest first.
    pub by_reason: Vec<(ReasonKind, i64)>,
}

/// Pagination for per-plate listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Page size.
    pub limit: i64,
    /// Rows to skip.
    pub offset: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rows() {
        let counts = StateCounts::from_rows(vec![
            ("pending".to_string(), 3),
            ("reported".to_string(), 5),
            ("overdue".to_string(), 1),
        ])
        .unwrap();

        assert_eq!(counts.pending, 3);
        assert_eq!(counts.get(SubmissionState::Reported), 5);
        assert_eq!(counts.total(), 9);
    }

    #[test]
    fn test_from_rows_rejects_unknown_state() {
        let err = StateCounts::from_rows(vec![("vencido".to_string(), 1)]).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}
