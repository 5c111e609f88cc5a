// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Regulatory time windows.
//!
//! | Window | Start | End |
//! |--------|-------|-----|
//! | Monitoring | appointment - 2h | appointment + 24h |
//! | Report submission | arrival | arrival + 72h |
//! | Exception detection / submission | appointment + 24h | appointment + 36h |

use chrono::{DateTime, Duration, Utc};

/// How long before the appointment a point starts being polled.
pub const MONITOR_LEAD: Duration = Duration::hours(2);

/// How long after the appointment a pending point keeps being polled.
pub const MONITOR_TAIL: Duration = Duration::hours(24);

/// Report submission window, counted from the detected arrival.
pub const REPORT_WINDOW: Duration = Duration::hours(72);

/// Dwell after which an undeparted vehicle is flagged "no departure".
pub const NO_DEPARTURE_AFTER: Duration = Duration::hours(72);

/// Exception reports open this long after the appointment.
pub const EXCEPTION_OPENS: Duration = Duration::hours(24);

/// Exception reports close this long after the appointment.
pub const EXCEPTION_CLOSES: Duration = Duration::hours(36);

/// Submission attempts allowed per report before it waits for the deadline sweep.
pub const MAX_ATTEMPTS: i32 = 3;

/// Deadline for a report whose arrival was detected at `arrival`.
pub fn report_deadline(arrival: DateTime<Utc>) -> DateTime<Utc> {
    arrival + REPORT_WINDOW
}

/// Deadline for an exception report against `appointment`.
pub fn exception_deadline(appointment: DateTime<Utc>) -> DateTime<Utc> {
    appointment + EXCEPTION_CLOSES
}

/// Whether `now` lies in `[appointment + 24h, appointment + 36h]`.
pub fn exception_window_open(appointment: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now >= appointment + EXCEPTION_OPENS && now <= appointment + EXCEPTION_CLOSES
}

/// Whether `now` lies in `[appointment - 2h, appointment + 24h]`.
pub fn monitoring_window_open(appointment: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now >= appointment - MONITOR_LEAD && now <= appointment + MONITOR_TAIL
}
