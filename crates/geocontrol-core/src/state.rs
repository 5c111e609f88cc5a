// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Closed state enums and their transition rules.
//!
//! ```text
//! Control point:   pending ──arrive──▶ at_point ──leave──▶ completed
//!
//! Submission (report / exception report):
//!
//!   pending ──claim──▶ sending ──ok──▶ reported ──annul──▶ annulled
//!      ▲                  │               │
//!      │                fail              └──departure──▶ pending
//!      │                  ▼
//!      └──retry/departure─ error
//!
//!   pending | error ──deadline──▶ overdue
//!   pending | error ──counterpart reported──▶ superseded
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Lifecycle of a single control point visit. Never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlPointState {
    /// Vehicle not yet seen inside the geofence.
    Pending,
    /// Vehicle detected inside the geofence, departure not yet seen.
    AtPoint,
    /// Vehicle left the geofence.
    Completed,
}

impl ControlPointState {
    /// Database/wire tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AtPoint => "at_point",
            Self::Completed => "completed",
        }
    }

    /// Move to `to`, rejecting anything but the next forward step.
    pub fn advance(self, to: Self) -> Result<Self, ModelError> {
        match (self, to) {
            (Self::Pending, Self::AtPoint) | (Self::AtPoint, Self::Completed) => Ok(to),
            (from, to) => Err(ModelError::InvalidTransition {
                entity: "control point",
                from: from.as_str(),
                to: to.as_str(),
            }),
        }
    }
}

/// Lifecycle of a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestState {
    /// Being monitored.
    Active,
    /// Every control point completed.
    Completed,
    /// Cancelled locally.
    Annulled,
}

impl ManifestState {
    /// Database/wire tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Annulled => "annulled",
        }
    }
}

/// Lifecycle of an outbound regulator submission.
///
/// Shared by arrival/departure reports and exception reports. Exception
/// reports never reach [`SubmissionState::Annulled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    /// Waiting for the dispatcher.
    Pending,
    /// Claimed by the dispatcher, request in flight.
    Sending,
    /// Accepted by the regulator.
    Reported,
    /// Deadline passed without acceptance. Terminal.
    Overdue,
    /// Last attempt failed; retried while budget and deadline allow.
    Error,
    /// Cancelled at the regulator after being reported. Terminal.
    Annulled,
    /// The counterpart submission for the same control point was accepted. Terminal.
    Superseded,
}

impl SubmissionState {
    /// Every state, in display order.
    pub const ALL: [SubmissionState; 7] = [
        Self::Pending,
        Self::Sending,
        Self::Reported,
        Self::Overdue,
        Self::Error,
        Self::Annulled,
        Self::Superseded,
    ];

    /// Database/wire tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Reported => "reported",
            Self::Overdue => "overdue",
            Self::Error => "error",
            Self::Annulled => "annulled",
            Self::Superseded => "superseded",
        }
    }

    /// No further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Overdue | Self::Annulled | Self::Superseded)
    }

    /// Eligible for dispatcher selection.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, Self::Pending | Self::Error)
    }

    /// Whether `self -> to` is an allowed edge.
    pub fn allows(self, to: Self) -> bool {
        use SubmissionState::*;
        match self {
            Pending => matches!(to, Pending | Sending | Overdue | Superseded),
            Sending => matches!(to, Reported | Error | Pending),
            Error => matches!(to, Pending | Sending | Overdue | Superseded),
            Reported => matches!(to, Pending | Annulled),
            Overdue | Annulled | Superseded => false,
        }
    }

    /// Move to `to` or fail with [`ModelError::InvalidTransition`].
    pub fn transition(self, entity: &'static str, to: Self) -> Result<Self, ModelError> {
        if self.allows(to) {
            Ok(to)
        } else {
            Err(ModelError::InvalidTransition {
                entity,
                from: self.as_str(),
                to: to.as_str(),
            })
        }
    }
}

macro_rules! tagged {
    ($ty:ty, $kind:literal, [$($variant:path),+ $(,)?]) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ModelError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s == $variant.as_str() {
                        return Ok($variant);
                    }
                )+
                Err(ModelError::UnknownTag {
                    kind: $kind,
                    value: s.to_string(),
                })
            }
        }
    };
}

tagged!(
    ControlPointState,
    "control point state",
    [
        ControlPointState::Pending,
        ControlPointState::AtPoint,
        ControlPointState::Completed,
    ]
);

tagged!(
    ManifestState,
    "manifest state",
    [
        ManifestState::Active,
        ManifestState::Completed,
        ManifestState::Annulled,
    ]
);

tagged!(
    SubmissionState,
    "submission state",
    [
        SubmissionState::Pending,
        SubmissionState::Sending,
        SubmissionState::Reported,
        SubmissionState::Overdue,
        SubmissionState::Error,
        SubmissionState::Annulled,
        SubmissionState::Superseded,
    ]
);
