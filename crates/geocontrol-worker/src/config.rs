// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for geocontrol-worker.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `GEOCONTROL_DATABASE_URL` | required |
//! | `REGULATOR_ENDPOINT` | production endpoint |
//! | `REGULATOR_USERNAME`, `REGULATOR_PASSWORD`, `REGULATOR_GPS_ID` | required |
//! | `REGULATOR_TIMEOUT_SECS` | 120 |
//! | `REGULATOR_TIMEZONE` | `America/Bogota` |
//! | `POSITION_API_URL`, `POSITION_USERNAME`, `POSITION_PASSWORD` | required |
//! | `POSITION_ADMIN_USERNAME`, `POSITION_ADMIN_PASSWORD` | unset |
//! | `POSITION_MONITORING_USER_ID` | unset |
//! | `POSITION_TIMEOUT_SECS` | 45 |
//! | `GEOCONTROL_SYNC_INTERVAL_SECS` | 900 |
//! | `GEOCONTROL_MONITOR_INTERVAL_SECS` | 60 |
//! | `GEOCONTROL_DISPATCH_INTERVAL_SECS` | 30 |
//! | `GEOCONTROL_EXCEPTION_DETECT_INTERVAL_SECS` | 3600 |
//! | `GEOCONTROL_EXCEPTION_DISPATCH_INTERVAL_SECS` | 900 |
//! | `GEOCONTROL_AUDIT_RETENTION_DAYS` | 7 |
//! | `GEOCONTROL_RESYNC_STATE_POLICY` | `preserve` |
//! | `GEOCONTROL_LOG_FORMAT` | `text` |

use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use geocontrol_core::ResyncStatePolicy;
use geocontrol_gateways::position::DEFAULT_TIMEOUT as POSITION_TIMEOUT;
use geocontrol_gateways::regulator::{DEFAULT_ENDPOINT, MIN_TIMEOUT};
use geocontrol_gateways::{Credentials, RegulatorClock, RegulatorConfig, TelemetryConfig};

use crate::audit_retention::AuditRetentionConfig;
use crate::dispatcher::ReportDispatcherConfig;
use crate::exception_detector::ExceptionDetectorConfig;
use crate::exception_dispatcher::ExceptionDispatcherConfig;
use crate::monitor::GeofenceMonitorConfig;
use crate::sync::ManifestSyncConfig;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Store URL (`postgres://…` or `sqlite:…`).
    pub database_url: String,
    /// Regulator SOAP endpoint.
    pub regulator_endpoint: String,
    /// Regulator account.
    pub regulator_credentials: Credentials,
    /// GPS provider id sent with every regulator request.
    pub regulator_gps_id: String,
    /// Regulator request timeout.
    pub regulator_timeout: Duration,
    /// Zone used for regulator dates.
    pub regulator_timezone: Tz,
    /// Telemetry API base URL.
    pub position_api_url: String,
    /// Monitoring account.
    pub position_credentials: Credentials,
    /// Admin account for global lookups and enrollment.
    pub position_admin_credentials: Option<Credentials>,
    /// Telemetry user id of the monitoring account.
    pub position_monitoring_user_id: Option<i64>,
    /// Telemetry request timeout.
    pub position_timeout: Duration,
    /// Manifest synchronizer period.
    pub sync_interval: Duration,
    /// Geofence monitor period.
    pub monitor_interval: Duration,
    /// Report dispatcher period.
    pub dispatch_interval: Duration,
    /// Exception detector period.
    pub exception_detect_interval: Duration,
    /// Exception dispatcher period.
    pub exception_dispatch_interval: Duration,
    /// How long regulator interactions are kept.
    pub audit_retention: Duration,
    /// How a resync treats locally finished manifests.
    pub resync_policy: ResyncStatePolicy,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value if set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars(&lookup);

        let position_admin_credentials = match (
            vars.optional("POSITION_ADMIN_USERNAME"),
            vars.optional("POSITION_ADMIN_PASSWORD"),
        ) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::MissingEnvVar("POSITION_ADMIN_PASSWORD")),
            (None, Some(_)) => return Err(ConfigError::MissingEnvVar("POSITION_ADMIN_USERNAME")),
        };

        Ok(Self {
            database_url: vars.required("GEOCONTROL_DATABASE_URL")?,
            regulator_endpoint: vars
                .optional("REGULATOR_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            regulator_credentials: Credentials::new(
                vars.required("REGULATOR_USERNAME")?,
                vars.required("REGULATOR_PASSWORD")?,
            ),
            regulator_gps_id: vars.required("REGULATOR_GPS_ID")?,
            regulator_timeout: vars
                .secs("REGULATOR_TIMEOUT_SECS", MIN_TIMEOUT.as_secs())?
                .max(MIN_TIMEOUT),
            regulator_timezone: vars
                .parsed("REGULATOR_TIMEZONE")?
                .unwrap_or(chrono_tz::America::Bogota),
            position_api_url: vars.required("POSITION_API_URL")?,
            position_credentials: Credentials::new(
                vars.required("POSITION_USERNAME")?,
                vars.required("POSITION_PASSWORD")?,
            ),
            position_admin_credentials,
            position_monitoring_user_id: vars.parsed("POSITION_MONITORING_USER_ID")?,
            position_timeout: vars.secs("POSITION_TIMEOUT_SECS", POSITION_TIMEOUT.as_secs())?,
            sync_interval: vars.secs("GEOCONTROL_SYNC_INTERVAL_SECS", 900)?,
            monitor_interval: vars.secs("GEOCONTROL_MONITOR_INTERVAL_SECS", 60)?,
            dispatch_interval: vars.secs("GEOCONTROL_DISPATCH_INTERVAL_SECS", 30)?,
            exception_detect_interval: vars.secs("GEOCONTROL_EXCEPTION_DETECT_INTERVAL_SECS", 3600)?,
            exception_dispatch_interval: vars
                .secs("GEOCONTROL_EXCEPTION_DISPATCH_INTERVAL_SECS", 900)?,
            audit_retention: Duration::from_secs(
                vars.parsed::<u64>("GEOCONTROL_AUDIT_RETENTION_DAYS")?
                    .unwrap_or(7)
                    * 24
                    * 3600,
            ),
            resync_policy: vars
                .parsed("GEOCONTROL_RESYNC_STATE_POLICY")?
                .unwrap_or_default(),
            log_format: match vars.optional("GEOCONTROL_LOG_FORMAT").as_deref() {
                None | Some("text") => LogFormat::Text,
                Some("json") => LogFormat::Json,
                Some(other) => {
                    return Err(ConfigError::InvalidValue {
                        var: "GEOCONTROL_LOG_FORMAT",
                        value: other.to_string(),
                    });
                }
            },
        })
    }

    /// Telemetry client settings.
    pub fn telemetry_config(&self) -> TelemetryConfig {
        let mut config =
            TelemetryConfig::new(&self.position_api_url, self.position_credentials.clone());
        config.admin_credentials = self.position_admin_credentials.clone();
        config.monitoring_user_id = self.position_monitoring_user_id;
        config.timeout = self.position_timeout;
        config
    }

    /// Regulator client settings.
    pub fn regulator_config(&self) -> RegulatorConfig {
        let mut config =
            RegulatorConfig::new(self.regulator_credentials.clone(), &self.regulator_gps_id);
        config.endpoint = self.regulator_endpoint.clone();
        config.timeout = self.regulator_timeout;
        config.clock = RegulatorClock::new(self.regulator_timezone);
        config
    }

    /// Manifest synchronizer settings.
    pub fn sync_config(&self) -> ManifestSyncConfig {
        ManifestSyncConfig {
            poll_interval: self.sync_interval,
            resync_policy: self.resync_policy,
            ..Default::default()
        }
    }

    /// Geofence monitor settings.
    pub fn monitor_config(&self) -> GeofenceMonitorConfig {
        GeofenceMonitorConfig {
            poll_interval: self.monitor_interval,
        }
    }

    /// Report dispatcher settings.
    pub fn dispatcher_config(&self) -> ReportDispatcherConfig {
        ReportDispatcherConfig {
            poll_interval: self.dispatch_interval,
            ..Default::default()
        }
    }

    /// Exception detector settings.
    pub fn exception_detector_config(&self) -> ExceptionDetectorConfig {
        ExceptionDetectorConfig {
            poll_interval: self.exception_detect_interval,
        }
    }

    /// Exception dispatcher settings.
    pub fn exception_dispatcher_config(&self) -> ExceptionDispatcherConfig {
        ExceptionDispatcherConfig {
            poll_interval: self.exception_dispatch_interval,
            ..Default::default()
        }
    }

    /// Audit retention settings.
    pub fn audit_retention_config(&self) -> AuditRetentionConfig {
        AuditRetentionConfig {
            retention: self.audit_retention,
            ..Default::default()
        }
    }
}

struct Vars<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::MissingEnvVar(name))
    }

    fn parsed<T: FromStr>(&self, name: &'static str) -> Result<Option<T>, ConfigError> {
        self.optional(name)
            .map(|raw| {
                raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    var: name,
                    value: raw,
                })
            })
            .transpose()
    }

    fn secs(&self, name: &'static str, default: u64) -> Result<Duration, ConfigError> {
        let secs = self.parsed::<u64>(name)?.unwrap_or(default);
        if secs == 0 {
            return Err(ConfigError::InvalidValue {
                var: name,
                value: "0".to_string(),
            });
        }
        Ok(Duration::from_secs(secs))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {var}: {value}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// Offending value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn required() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("GEOCONTROL_DATABASE_URL", "sqlite::memory:"),
            ("REGULATOR_USERNAME", "carrier"),
            ("REGULATOR_PASSWORD", "secret"),
            ("REGULATOR_GPS_ID", "8600123"),
            ("POSITION_API_URL", "https://telemetry.example"),
            ("POSITION_USERNAME", "monitor"),
            ("POSITION_PASSWORD", "secret"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<Config, ConfigError> {
        Config::from_lookup(|name| vars.get(name).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults() {
        let config = load(&required()).unwrap();

        assert_eq!(config.regulator_endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.regulator_timeout, Duration::from_secs(120));
        assert_eq!(config.regulator_timezone, chrono_tz::America::Bogota);
        assert_eq!(config.position_timeout, Duration::from_secs(45));
        assert_eq!(config.sync_interval, Duration::from_secs(900));
        assert_eq!(config.monitor_interval, Duration::from_secs(60));
        assert_eq!(config.dispatch_interval, Duration::from_secs(30));
        assert_eq!(config.exception_detect_interval, Duration::from_secs(3600));
        assert_eq!(config.exception_dispatch_interval, Duration::from_secs(900));
        assert_eq!(config.audit_retention, Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.resync_policy, ResyncStatePolicy::Preserve);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.position_admin_credentials.is_none());
    }

    #[test]
    fn test_missing_required_variable() {
        let mut vars = required();
        vars.remove("REGULATOR_GPS_ID");
        assert!(matches!(
            load(&vars),
            Err(ConfigError::MissingEnvVar("REGULATOR_GPS_ID"))
        ));
    }

    #[test]
    fn test_overrides() {
        let mut vars = required();
        vars.insert("REGULATOR_TIMEOUT_SECS", "30");
        vars.insert("REGULATOR_TIMEZONE", "America/Lima");
        vars.insert("GEOCONTROL_MONITOR_INTERVAL_SECS", "15");
        vars.insert("GEOCONTROL_RESYNC_STATE_POLICY", "force-active");
        vars.insert("GEOCONTROL_LOG_FORMAT", "json");
        vars.insert("POSITION_ADMIN_USERNAME", "admin");
        vars.insert("POSITION_ADMIN_PASSWORD", "secret");
        vars.insert("POSITION_MONITORING_USER_ID", "77");

        let config = load(&vars).unwrap();

        assert_eq!(config.regulator_timeout, Duration::from_secs(120), "floor applies");
        assert_eq!(config.regulator_timezone, chrono_tz::America::Lima);
        assert_eq!(config.monitor_config().poll_interval, Duration::from_secs(15));
        assert_eq!(config.sync_config().resync_policy, ResyncStatePolicy::ForceActive);
        assert_eq!(config.log_format, LogFormat::Json);

        let telemetry = config.telemetry_config();
        assert_eq!(telemetry.monitoring_user_id, Some(77));
        assert!(telemetry.admin_credentials.is_some());
    }

    #[test]
    fn test_invalid_values() {
        let mut vars = required();
        vars.insert("GEOCONTROL_DISPATCH_INTERVAL_SECS", "soon");
        assert!(matches!(
            load(&vars),
            Err(ConfigError::InvalidValue {
                var: "GEOCONTROL_DISPATCH_INTERVAL_SECS",
                ..
            })
        ));

        let mut vars = required();
        vars.insert("GEOCONTROL_SYNC_INTERVAL_SECS", "0");
        assert!(load(&vars).is_err());

        let mut vars = required();
        vars.insert("POSITION_ADMIN_USERNAME", "admin");
        assert!(matches!(
            load(&vars),
            Err(ConfigError::MissingEnvVar("POSITION_ADMIN_PASSWORD"))
        ));
    }
}
