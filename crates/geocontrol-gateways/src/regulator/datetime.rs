// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Regulator date and time formats.
//!
//! The regulator exchanges local wall-clock values: dates as `DD/MM/YYYY`
//! and times as `HH:MM`, both in the regulator's time zone.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Zone used when none is configured.
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Bogota;

const DATE_FORMAT: &str = "%d/%m/%Y";
const TIME_FORMAT: &str = "%H:%M";

/// Converts between UTC instants and regulator wall-clock strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegulatorClock {
    tz: Tz,
}

impl Default for RegulatorClock {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEZONE)
    }
}

impl RegulatorClock {
    /// Clock for `tz`.
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    /// Configured zone.
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// `DD/MM/YYYY` in the regulator zone.
    pub fn date(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.tz).format(DATE_FORMAT).to_string()
    }

    /// `HH:MM` in the regulator zone.
    pub fn time(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.tz).format(TIME_FORMAT).to_string()
    }

    /// Parse a `DD/MM/YYYY` date.
    pub fn parse_date(&self, raw: &str) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
    }

    /// Combine a regulator date and optional time into a UTC instant.
    ///
    /// A missing or unparseable time means midnight; `HH:MM:SS` is accepted.
    pub fn appointment(&self, date: &str, time: Option<&str>) -> Option<DateTime<Utc>> {
        let date = self.parse_date(date)?;
        let time = time
            .map(str::trim)
            .and_then(|t| {
                NaiveTime::parse_from_str(t, TIME_FORMAT)
                    .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M:%S"))
                    .ok()
            })
            .unwrap_or(NaiveTime::MIN);

        self.tz
            .from_local_datetime(&NaiveDateTime::new(date, time))
            .earliest()
            .map(|local| local.with_timezone(&Utc))
    }
}
