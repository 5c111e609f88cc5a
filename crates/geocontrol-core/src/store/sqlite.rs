// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store implementation.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::audit::{InteractionFilter, RegulatorInteraction};
use crate::error::{Result, StoreError};
use crate::migrations;
use crate::model::{ControlPoint, ExceptionReport, Fix, Manifest, ReasonKind, Report};
use crate::state::ManifestState;
use crate::stats::{ManifestCounts, Page, PlateCounts, StateCounts};

use super::rows::{
    CONTROL_POINT_COLUMNS, ControlPointRow, EXCEPTION_COLUMNS, ExceptionRow, INTERACTION_COLUMNS,
    InteractionRow, MANIFEST_COLUMNS, ManifestRow, REPORT_COLUMNS, ReportRow, fix_columns,
    map_rows,
};
use super::{Store, SubmissionOutcome, UpsertOutcome, fold_plate_counts};

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url`, creating the database file if needed, and run migrations.
    ///
    /// In-memory URLs get a single connection so every query sees the same database.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = if url.contains(":memory:") {
            // The database lives only as long as its connection.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .connect_with(options)
        .await?;

        migrations::SQLITE.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Open (or create) the database at `path`, creating parent directories.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Self::connect(&format!("sqlite:{}", path.to_string_lossy())).await
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_points(&self, manifest_id: &str) -> Result<Vec<ControlPoint>> {
        let sql = format!(
            "SELECT {CONTROL_POINT_COLUMNS} FROM control_points WHERE manifest_id = ? ORDER BY code"
        );
        let rows = sqlx::query_as::<_, ControlPointRow>(&sql)
            .bind(manifest_id)
            .fetch_all(&self.pool)
            .await?;
        map_rows(rows)
    }

    async fn hydrate(&self, rows: Vec<ManifestRow>) -> Result<Vec<Manifest>> {
        let mut manifests = Vec::with_capacity(rows.len());
        for row in rows {
            let points = self.load_points(&row.id).await?;
            manifests.push(row.into_manifest(points)?);
        }
        Ok(manifests)
    }

    async fn fetch_manifest(&self, column: &str, value: &str) -> Result<Option<Manifest>> {
        let sql = format!("SELECT {MANIFEST_COLUMNS} FROM manifests WHERE {column} = ?");
        let row = sqlx::query_as::<_, ManifestRow>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        Ok(self.hydrate(row.into_iter().collect()).await?.pop())
    }

    async fn counts(&self, table: &str, plate: Option<&str>) -> Result<StateCounts> {
        let rows: Vec<(String, i64)> = match plate {
            Some(plate) => {
                let sql =
                    format!("SELECT state, COUNT(*) FROM {table} WHERE plate = ? GROUP BY state");
                sqlx::query_as(&sql)
                    .bind(plate)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("SELECT state, COUNT(*) FROM {table} GROUP BY state");
                sqlx::query_as(&sql).fetch_all(&self.pool).await?
            }
        };
        StateCounts::from_rows(rows)
    }
}

async fn upsert_point(
    tx: &mut Transaction<'_, Sqlite>,
    manifest_id: &str,
    point: &ControlPoint,
) -> Result<()> {
    let (arrival_at, arrival_lat, arrival_lon) = fix_columns(point.arrival);
    let (departure_at, departure_lat, departure_lon) = fix_columns(point.departure);

    sqlx::query(
        r#"
        INSERT INTO control_points (
            id, manifest_id, code, municipality_code, address, latitude, longitude,
            radius_m, appointment, pact_minutes, adjusted, state,
            arrival_at, arrival_latitude, arrival_longitude,
            departure_at, departure_latitude, departure_longitude,
            no_departure, report_id, confirmation_id
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (id) DO UPDATE SET
            code = excluded.code,
            municipality_code = excluded.municipality_code,
            address = excluded.address,
            latitude = excluded.latitude,
            longitude = excluded.longitude,
            radius_m = excluded.radius_m,
            appointment = excluded.appointment,
            pact_minutes = excluded.pact_minutes,
            adjusted = excluded.adjusted,
            state = excluded.state,
            arrival_at = excluded.arrival_at,
            arrival_latitude = excluded.arrival_latitude,
            arrival_longitude = excluded.arrival_longitude,
            departure_at = excluded.departure_at,
            departure_latitude = excluded.departure_latitude,
            departure_longitude = excluded.departure_longitude,
            no_departure = excluded.no_departure,
            report_id = excluded.report_id
        "#,
    )
    .bind(point.id.to_string())
    .bind(manifest_id)
    .bind(point.code)
    .bind(&point.municipality_code)
    .bind(&point.address)
    .bind(point.location.latitude)
    .bind(point.location.longitude)
    .bind(point.radius_m)
    .bind(point.appointment)
    .bind(point.pact_minutes)
    .bind(point.adjusted)
    .bind(point.state.as_str())
    .bind(arrival_at)
    .bind(arrival_lat)
    .bind(arrival_lon)
    .bind(departure_at)
    .bind(departure_lat)
    .bind(departure_lon)
    .bind(point.no_departure)
    .bind(point.report_id.map(|id| id.to_string()))
    .bind(&point.confirmation_id)
    .execute(&mut **tx)
    .await
    .map_err(|e| StoreError::on_insert("control point", e))?;

    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put_setting(&self, key: &str, value: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_manifest(&self, id: Uuid) -> Result<Option<Manifest>> {
        self.fetch_manifest("id", &id.to_string()).await
    }

    async fn get_manifest_by_external_id(&self, external_id: &str) -> Result<Option<Manifest>> {
        self.fetch_manifest("external_id", external_id).await
    }

    async fn save_manifest(&self, manifest: &Manifest) -> Result<UpsertOutcome> {
        let id = manifest.id.to_string();
        let (reason_kind, reason_detail) = match &manifest.not_monitorable {
            Some(reason) => (Some(reason.kind.as_str()), Some(reason.detail.as_str())),
            None => (None, None),
        };

        let mut tx = self.pool.begin().await?;

        let exists = sqlx::query_scalar::<_, String>("SELECT id FROM manifests WHERE id = ?")
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();

        let outcome = if exists {
            sqlx::query(
                r#"
                UPDATE manifests
                SET number = ?, carrier_tax_id = ?, plate = ?, issued_on = ?, state = ?,
                    vehicle_authorized = ?, monitorable = ?, reason_kind = ?, reason_detail = ?,
                    updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(&manifest.number)
            .bind(&manifest.carrier_tax_id)
            .bind(&manifest.plate)
            .bind(manifest.issued_on)
            .bind(manifest.state.as_str())
            .bind(manifest.vehicle_authorized)
            .bind(manifest.monitorable)
            .bind(reason_kind)
            .bind(reason_detail)
            .bind(manifest.updated_at)
            .bind(&id)
            .execute(&mut *tx)
            .await?;
            UpsertOutcome::Updated
        } else {
            sqlx::query(
                r#"
                INSERT INTO manifests (
                    id, external_id, number, carrier_tax_id, plate, issued_on, state,
                    vehicle_authorized, monitorable, reason_kind, reason_detail,
                    created_at, updated_at
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(&manifest.external_id)
            .bind(&manifest.number)
            .bind(&manifest.carrier_tax_id)
            .bind(&manifest.plate)
            .bind(manifest.issued_on)
            .bind(manifest.state.as_str())
            .bind(manifest.vehicle_authorized)
            .bind(manifest.monitorable)
            .bind(reason_kind)
            .bind(reason_detail)
            .bind(manifest.created_at)
            .bind(manifest.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::on_insert("manifest", e))?;
            UpsertOutcome::Inserted
        };

        let stored: Vec<String> =
            sqlx::query_scalar("SELECT id FROM control_points WHERE manifest_id = ?")
                .bind(&id)
                .fetch_all(&mut *tx)
                .await?;
        let keep: Vec<String> = manifest
            .control_points
            .iter()
            .map(|p| p.id.to_string())
            .collect();

        for stale in stored.iter().filter(|s| !keep.contains(s)) {
            sqlx::query("DELETE FROM control_points WHERE id = ?")
                .bind(stale)
                .execute(&mut *tx)
                .await?;
        }

        for point in &manifest.control_points {
            upsert_point(&mut tx, &id, point).await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn list_monitorable_manifests(&self) -> Result<Vec<Manifest>> {
        let sql = format!(
            "SELECT {MANIFEST_COLUMNS} FROM manifests \
             WHERE state = 'active' AND monitorable ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, ManifestRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        self.hydrate(rows).await
    }

    async fn list_unregistered_manifests(&self) -> Result<Vec<Manifest>> {
        let sql = format!(
            "SELECT {MANIFEST_COLUMNS} FROM manifests \
             WHERE state = 'active' AND NOT monitorable AND reason_kind = 'not_registered' \
             ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, ManifestRow>(&sql)
            .fetch_all(&self.pool)
            .await?;
        self.hydrate(rows).await
    }

    async fn set_control_point_confirmation(
        &self,
        control_point_id: Uuid,
        confirmation_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query("UPDATE control_points SET confirmation_id = ? WHERE id = ?")
            .bind(confirmation_id)
            .bind(control_point_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_tracking(
        &self,
        manifest_id: Uuid,
        state: Option<ManifestState>,
        points: &[ControlPoint],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let manifest_id = manifest_id.to_string();
        let mut tx = self.pool.begin().await?;

        for point in points {
            let (arrival_at, arrival_lat, arrival_lon) = fix_columns(point.arrival);
            let (departure_at, departure_lat, departure_lon) = fix_columns(point.departure);
            sqlx::query(
                r#"
                UPDATE control_points
                SET state = ?, arrival_at = ?, arrival_latitude = ?, arrival_longitude = ?,
                    departure_at = ?, departure_latitude = ?, departure_longitude = ?,
                    no_departure = ?, report_id = ?
                WHERE id = ? AND manifest_id = ?
                "#,
            )
            .bind(point.state.as_str())
            .bind(arrival_at)
            .bind(arrival_lat)
            .bind(arrival_lon)
            .bind(departure_at)
            .bind(departure_lat)
            .bind(departure_lon)
            .bind(point.no_departure)
            .bind(point.report_id.map(|id| id.to_string()))
            .bind(point.id.to_string())
            .bind(&manifest_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            UPDATE manifests
            SET state = COALESCE(?, state), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(state.map(ManifestState::as_str))
        .bind(now)
        .bind(&manifest_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn insert_report(&self, report: &Report) -> Result<()> {
        let (departure_at, departure_lat, departure_lon) = fix_columns(report.departure);

        sqlx::query(
            r#"
            INSERT INTO reports (
                id, manifest_id, control_point_id, manifest_external_id, plate, point_code,
                arrival_at, arrival_latitude, arrival_longitude,
                departure_at, departure_latitude, departure_longitude,
                departure_estimated, no_departure, pact_minutes, state, deadline, attempts,
                last_attempt_at, confirmation_id, last_error, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(report.id.to_string())
        .bind(report.manifest_id.to_string())
        .bind(report.control_point_id.to_string())
        .bind(&report.manifest_external_id)
        .bind(&report.plate)
        .bind(report.point_code)
        .bind(report.arrival.at)
        .bind(report.arrival.point.latitude)
        .bind(report.arrival.point.longitude)
        .bind(departure_at)
        .bind(departure_lat)
        .bind(departure_lon)
        .bind(report.departure_estimated)
        .bind(report.no_departure)
        .bind(report.pact_minutes)
        .bind(report.state.as_str())
        .bind(report.deadline)
        .bind(report.attempts)
        .bind(report.last_attempt_at)
        .bind(&report.confirmation_id)
        .bind(&report.last_error)
        .bind(report.created_at)
        .bind(report.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::on_insert("report", e))?;

        Ok(())
    }

    async fn get_report(&self, id: Uuid) -> Result<Option<Report>> {
        let sql = format!("SELECT {REPORT_COLUMNS} FROM reports WHERE id = ?");
        let row = sqlx::query_as::<_, ReportRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Report::try_from).transpose()
    }

    async fn find_report_for_point(
        &self,
        manifest_id: Uuid,
        control_point_id: Uuid,
    ) -> Result<Option<Report>> {
        let sql = format!(
            "SELECT {REPORT_COLUMNS} FROM reports \
             WHERE manifest_id = ? AND control_point_id = ? AND state <> 'annulled'"
        );
        let row = sqlx::query_as::<_, ReportRow>(&sql)
            .bind(manifest_id.to_string())
            .bind(control_point_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Report::try_from).transpose()
    }

    async fn update_report(&self, report: &Report) -> Result<()> {
        let (departure_at, departure_lat, departure_lon) = fix_columns(report.departure);

        sqlx::query(
            r#"
            UPDATE reports
            SET departure_at = ?, departure_latitude = ?, departure_longitude = ?,
                departure_estimated = ?, no_departure = ?, state = ?, attempts = ?,
                last_attempt_at = ?, confirmation_id = ?, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(departure_at)
        .bind(departure_lat)
        .bind(departure_lon)
        .bind(report.departure_estimated)
        .bind(report.no_departure)
        .bind(report.state.as_str())
        .bind(report.attempts)
        .bind(report.last_attempt_at)
        .bind(&report.confirmation_id)
        .bind(&report.last_error)
        .bind(report.updated_at)
        .bind(report.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::on_insert("report", e))?;

        Ok(())
    }

    async fn list_dispatchable_reports(
        &self,
        now: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<Report>> {
        let sql = format!(
            "SELECT {REPORT_COLUMNS} FROM reports \
             WHERE state IN ('pending', 'error') AND deadline > ? AND attempts < ? \
             ORDER BY deadline ASC LIMIT ?"
        );
        let rows = sqlx::query_as::<_, ReportRow>(&sql)
            .bind(now)
            .bind(max_attempts)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        map_rows(rows)
    }

    async fn claim_report(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE reports
            SET state = 'sending', attempts = attempts + 1, last_attempt_at = ?, updated_at = ?
            WHERE id = ? AND state IN ('pending', 'error')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_report(
        &self,
        id: Uuid,
        outcome: &SubmissionOutcome,
        estimated_departure: Option<Fix>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = match (outcome, estimated_departure) {
            (SubmissionOutcome::Accepted { confirmation_id }, Some(departure)) => {
                sqlx::query(
                    r#"
                    UPDATE reports
                    SET state = 'reported', confirmation_id = ?, last_error = NULL,
                        departure_at = ?, departure_latitude = ?, departure_longitude = ?,
                        departure_estimated = 1, updated_at = ?
                    WHERE id = ? AND state = 'sending'
                    "#,
                )
                .bind(confirmation_id)
                .bind(departure.at)
                .bind(departure.point.latitude)
                .bind(departure.point.longitude)
                .bind(now)
                .bind(id.to_string())
                .execute(&self.pool)
                .await?
            }
            (SubmissionOutcome::Accepted { confirmation_id }, None) => {
                sqlx::query(
                    r#"
                    UPDATE reports
                    SET state = 'reported', confirmation_id = ?, last_error = NULL, updated_at = ?
                    WHERE id = ? AND state = 'sending'
                    "#,
                )
                .bind(confirmation_id)
                .bind(now)
                .bind(id.to_string())
                .execute(&self.pool)
                .await?
            }
            (SubmissionOutcome::Failed { error }, _) => {
                sqlx::query(
                    r#"
                    UPDATE reports
                    SET state = 'error', last_error = ?, updated_at = ?
                    WHERE id = ? AND state = 'sending'
                    "#,
                )
                .bind(error)
                .bind(now)
                .bind(id.to_string())
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }

    async fn mark_overdue_reports(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE reports
            SET state = 'overdue', updated_at = ?
            WHERE state IN ('pending', 'error') AND deadline < ?
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn recover_stale_reports(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE reports
            SET state = 'error', last_error = 'submission interrupted', updated_at = ?
            WHERE state = 'sending' AND last_attempt_at < ?
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_exception(&self, exception: &ExceptionReport) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO exception_reports (
                id, manifest_id, control_point_id, manifest_external_id, plate, point_code,
                code, detail, state, appointment, deadline, attempts, last_attempt_at,
                confirmation_id, last_error, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(exception.id.to_string())
        .bind(exception.manifest_id.to_string())
        .bind(exception.control_point_id.to_string())
        .bind(&exception.manifest_external_id)
        .bind(&exception.plate)
        .bind(exception.point_code)
        .bind(exception.code.code())
        .bind(&exception.detail)
        .bind(exception.state.as_str())
        .bind(exception.appointment)
        .bind(exception.deadline)
        .bind(exception.attempts)
        .bind(exception.last_attempt_at)
        .bind(&exception.confirmation_id)
        .bind(&exception.last_error)
        .bind(exception.created_at)
        .bind(exception.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::on_insert("exception report", e))?;

        Ok(())
    }

    async fn get_exception(&self, id: Uuid) -> Result<Option<ExceptionReport>> {
        let sql = format!("SELECT {EXCEPTION_COLUMNS} FROM exception_reports WHERE id = ?");
        let row = sqlx::query_as::<_, ExceptionRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(ExceptionReport::try_from).transpose()
    }

    async fn find_exception_for_point(
        &self,
        manifest_id: Uuid,
        control_point_id: Uuid,
    ) -> Result<Option<ExceptionReport>> {
        let sql = format!(
            "SELECT {EXCEPTION_COLUMNS} FROM exception_reports \
             WHERE manifest_id = ? AND control_point_id = ?"
        );
        let row = sqlx::query_as::<_, ExceptionRow>(&sql)
            .bind(manifest_id.to_string())
            .bind(control_point_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(ExceptionReport::try_from).transpose()
    }

    async fn update_exception(&self, exception: &ExceptionReport) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE exception_reports
            SET detail = ?, state = ?, attempts = ?, last_attempt_at = ?,
                confirmation_id = ?, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&exception.detail)
        .bind(exception.state.as_str())
        .bind(exception.attempts)
        .bind(exception.last_attempt_at)
        .bind(&exception.confirmation_id)
        .bind(&exception.last_error)
        .bind(exception.updated_at)
        .bind(exception.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_dispatchable_exceptions(
        &self,
        now: DateTime<Utc>,
        max_attempts: i32,
        limit: i64,
    ) -> Result<Vec<ExceptionReport>> {
        let sql = format!(
            "SELECT {EXCEPTION_COLUMNS} FROM exception_reports \
             WHERE state IN ('pending', 'error') AND deadline > ? AND attempts < ? \
             ORDER BY deadline ASC LIMIT ?"
        );
        let rows = sqlx::query_as::<_, ExceptionRow>(&sql)
            .bind(now)
            .bind(max_attempts)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        map_rows(rows)
    }

    async fn claim_exception(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE exception_reports
            SET state = 'sending', attempts = attempts + 1, last_attempt_at = ?, updated_at = ?
            WHERE id = ? AND state IN ('pending', 'error')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn finish_exception(
        &self,
        id: Uuid,
        outcome: &SubmissionOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let query = match outcome {
            SubmissionOutcome::Accepted { confirmation_id } => sqlx::query(
                r#"
                UPDATE exception_reports
                SET state = 'reported', confirmation_id = ?, last_error = NULL, updated_at = ?
                WHERE id = ? AND state = 'sending'
                "#,
            )
            .bind(confirmation_id),
            SubmissionOutcome::Failed { error } => sqlx::query(
                r#"
                UPDATE exception_reports
                SET state = 'error', last_error = ?, updated_at = ?
                WHERE id = ? AND state = 'sending'
                "#,
            )
            .bind(error),
        };
        let result = query
            .bind(now)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_overdue_exceptions(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE exception_reports
            SET state = 'overdue', updated_at = ?
            WHERE state IN ('pending', 'error') AND deadline < ?
            "#,
        )
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn recover_stale_exceptions(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE exception_reports
            SET state = 'error', last_error = 'submission interrupted', updated_at = ?
            WHERE state = 'sending' AND last_attempt_at < ?
            "#,
        )
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn record_interaction(&self, interaction: &RegulatorInteraction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO regulator_interactions (
                id, occurred_at, kind, endpoint, outcome, duration_ms,
                request_payload, response_payload, metadata
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(interaction.id.to_string())
        .bind(interaction.occurred_at)
        .bind(interaction.kind.as_str())
        .bind(&interaction.endpoint)
        .bind(interaction.outcome.as_str())
        .bind(interaction.duration_ms)
        .bind(&interaction.request_payload)
        .bind(&interaction.response_payload)
        .bind(interaction.metadata.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_interactions(
        &self,
        filter: &InteractionFilter,
    ) -> Result<Vec<RegulatorInteraction>> {
        let sql = format!(
            "SELECT {INTERACTION_COLUMNS} FROM regulator_interactions \
             WHERE (? IS NULL OR outcome = ?) AND (? IS NULL OR kind = ?) \
             ORDER BY occurred_at DESC LIMIT ? OFFSET ?"
        );
        let outcome = filter.outcome.map(|o| o.as_str());
        let kind = filter.kind.map(|k| k.as_str());
        let rows = sqlx::query_as::<_, InteractionRow>(&sql)
            .bind(outcome)
            .bind(outcome)
            .bind(kind)
            .bind(kind)
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(&self.pool)
            .await?;
        map_rows(rows)
    }

    async fn purge_interactions(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM regulator_interactions WHERE occurred_at < ?")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn report_counts(&self, plate: Option<&str>) -> Result<StateCounts> {
        self.counts("reports", plate).await
    }

    async fn exception_counts(&self, plate: Option<&str>) -> Result<StateCounts> {
        self.counts("exception_reports", plate).await
    }

    async fn report_counts_by_plate(&self, page: Page) -> Result<Vec<PlateCounts>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT plate, state, COUNT(*)
            FROM reports
            WHERE plate IN (
                SELECT plate FROM reports GROUP BY plate ORDER BY plate LIMIT ? OFFSET ?
            )
            GROUP BY plate, state
            ORDER BY plate, state
            "#,
        )
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(&self.pool)
        .await?;
        fold_plate_counts(rows)
    }

    async fn manifest_counts(&self) -> Result<ManifestCounts> {
        let (total, active, completed, annulled, monitorable): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN state = 'active' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN state = 'completed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN state = 'annulled' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN monitorable THEN 1 ELSE 0 END), 0)
                FROM manifests
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

        let reasons: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT reason_kind, COUNT(*)
            FROM manifests
            WHERE NOT monitorable AND reason_kind IS NOT NULL
            GROUP BY reason_kind
            ORDER BY COUNT(*) DESC, reason_kind
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let by_reason = reasons
            .into_iter()
            .map(|(kind, n)| {
                kind.parse::<ReasonKind>()
                    .map(|kind| (kind, n))
                    .map_err(|e| StoreError::corrupt("manifest", format!("{e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ManifestCounts {
            total,
            active,
            completed,
            annulled,
            monitorable,
            not_monitorable: total - monitorable,
            by_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{InteractionKind, InteractionOutcome};
    use crate::geo::GeoPoint;
    use crate::model::{ExceptionCode, NotMonitorableReason};
    use crate::state::{ControlPointState, ManifestState, SubmissionState};
    use chrono::{Duration, TimeZone};

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        migrations::SQLITE.run(&pool).await.expect("Failed to run migrations");

        pool
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn manifest(external_id: &str, plate: &str) -> Manifest {
        let mut m = Manifest::new(external_id, "M-77", "900111222", plate, t0());
        let mut p1 = ControlPoint::new(1, GeoPoint::new(4.60, -74.08), 300.0);
        p1.appointment = Some(t0());
        p1.pact_minutes = 30;
        let p2 = ControlPoint::new(2, GeoPoint::new(6.24, -75.58), 300.0);
        m.control_points = vec![p1, p2];
        m.classify(true, true, None);
        m
    }

    fn report_for(m: &Manifest, idx: usize) -> Report {
        let point = &m.control_points[idx];
        Report::for_arrival(m, point, Fix::new(t0(), point.location))
    }

    #[tokio::test]
    async fn test_settings_round_trip() {
        let store = SqliteStore::new(test_pool().await);

        assert_eq!(store.get_setting("k").await.unwrap(), None);
        store.put_setting("k", "v1", t0()).await.unwrap();
        store.put_setting("k", "v2", t0()).await.unwrap();
        assert_eq!(store.get_setting("k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_save_and_reload_manifest() {
        let store = SqliteStore::new(test_pool().await);
        let m = manifest("1001", "ABC123");

        assert_eq!(store.save_manifest(&m).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.save_manifest(&m).await.unwrap(), UpsertOutcome::Updated);

        let loaded = store
            .get_manifest_by_external_id("1001")
            .await
            .unwrap()
            .expect("manifest should exist");
        assert_eq!(loaded, m);
        assert_eq!(store.get_manifest(m.id).await.unwrap(), Some(m));
    }

    #[tokio::test]
    async fn test_save_manifest_replaces_points() {
        let store = SqliteStore::new(test_pool().await);
        let mut m = manifest("1002", "ABC123");
        store.save_manifest(&m).await.unwrap();

        m.control_points.remove(1);
        m.control_points[0].state = ControlPointState::AtPoint;
        m.control_points[0].arrival = Some(Fix::new(t0(), GeoPoint::new(4.6001, -74.08)));
        store.save_manifest(&m).await.unwrap();

        let loaded = store.get_manifest(m.id).await.unwrap().unwrap();
        assert_eq!(loaded.control_points.len(), 1);
        assert_eq!(loaded.control_points[0].state, ControlPointState::AtPoint);
        assert_eq!(loaded.control_points[0].arrival, m.control_points[0].arrival);
    }

    #[tokio::test]
    async fn test_save_manifest_keeps_point_confirmation() {
        let store = SqliteStore::new(test_pool().await);
        let mut m = manifest("1003", "ABC123");
        store.save_manifest(&m).await.unwrap();
        store
            .set_control_point_confirmation(m.control_points[0].id, Some("C-1"))
            .await
            .unwrap();

        m.number = "M-78".to_string();
        store.save_manifest(&m).await.unwrap();

        let loaded = store.get_manifest(m.id).await.unwrap().unwrap();
        assert_eq!(loaded.number, "M-78");
        assert_eq!(loaded.control_points[0].confirmation_id.as_deref(), Some("C-1"));
    }

    #[tokio::test]
    async fn test_save_tracking_writes_tracking_columns_only() {
        let store = SqliteStore::new(test_pool().await);
        let mut m = manifest("1004", "ABC123");
        store.save_manifest(&m).await.unwrap();
        store
            .set_control_point_confirmation(m.control_points[0].id, Some("C-2"))
            .await
            .unwrap();

        // A stale copy: classification and confirmation differ from the stored row.
        m.classify(false, false, Some(NotMonitorableReason::not_registered()));
        m.control_points[0].confirmation_id = Some("C-1".to_string());
        m.control_points[0].state = ControlPointState::Completed;
        m.control_points[0].arrival = Some(Fix::new(t0(), GeoPoint::new(4.60, -74.08)));
        m.control_points[0].no_departure = true;
        let later = t0() + Duration::hours(1);

        store
            .save_tracking(m.id, None, &m.control_points[..1], later)
            .await
            .unwrap();
        let loaded = store.get_manifest(m.id).await.unwrap().unwrap();
        assert!(loaded.monitorable);
        assert_eq!(loaded.state, ManifestState::Active);
        assert_eq!(loaded.updated_at, later);
        assert_eq!(loaded.control_points[0].state, ControlPointState::Completed);
        assert_eq!(loaded.control_points[0].arrival, m.control_points[0].arrival);
        assert!(loaded.control_points[0].no_departure);
        assert_eq!(loaded.control_points[0].confirmation_id.as_deref(), Some("C-2"));
        assert_eq!(loaded.control_points[1].state, ControlPointState::Pending);

        store
            .save_tracking(m.id, Some(ManifestState::Completed), &[], later)
            .await
            .unwrap();
        let loaded = store.get_manifest(m.id).await.unwrap().unwrap();
        assert_eq!(loaded.state, ManifestState::Completed);
    }

    #[tokio::test]
    async fn test_duplicate_external_id_conflicts() {
        let store = SqliteStore::new(test_pool().await);
        store.save_manifest(&manifest("1003", "AAA111")).await.unwrap();

        let err = store
            .save_manifest(&manifest("1003", "AAA111"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_monitorable_and_unregistered_listings() {
        let store = SqliteStore::new(test_pool().await);
        let tracked = manifest("2001", "TRK001");
        let mut unknown = manifest("2002", "UNK002");
        unknown.classify(false, false, Some(NotMonitorableReason::not_registered()));
        let mut finished = manifest("2003", "FIN003");
        finished.state = ManifestState::Completed;

        for m in [&tracked, &unknown, &finished] {
            store.save_manifest(m).await.unwrap();
        }

        let monitorable = store.list_monitorable_manifests().await.unwrap();
        assert_eq!(monitorable.len(), 1);
        assert_eq!(monitorable[0].external_id, "2001");
        assert_eq!(monitorable[0].control_points.len(), 2);

        let unregistered = store.list_unregistered_manifests().await.unwrap();
        assert_eq!(unregistered.len(), 1);
        assert_eq!(unregistered[0].external_id, "2002");
    }

    #[tokio::test]
    async fn test_one_live_report_per_point() {
        let store = SqliteStore::new(test_pool().await);
        let m = manifest("3001", "ABC123");
        store.save_manifest(&m).await.unwrap();

        let mut first = report_for(&m, 0);
        store.insert_report(&first).await.unwrap();

        let err = store.insert_report(&report_for(&m, 0)).await.unwrap_err();
        assert!(err.is_conflict());

        first.state = SubmissionState::Reported;
        first.confirmation_id = Some("RMM-1".into());
        store.update_report(&first).await.unwrap();
        first.annul(t0()).unwrap();
        store.update_report(&first).await.unwrap();

        // Annulled reports release the slot.
        store.insert_report(&report_for(&m, 0)).await.unwrap();
        let live = store
            .find_report_for_point(m.id, m.control_points[0].id)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(live.id, first.id);
    }

    #[tokio::test]
    async fn test_dispatch_selection_orders_by_deadline_and_respects_budget() {
        let store = SqliteStore::new(test_pool().await);
        let m = manifest("3002", "ABC123");
        store.save_manifest(&m).await.unwrap();

        let mut late = report_for(&m, 0);
        late.deadline = t0() + Duration::hours(60);
        let mut soon = report_for(&m, 1);
        soon.deadline = t0() + Duration::hours(2);
        store.insert_report(&late).await.unwrap();
        store.insert_report(&soon).await.unwrap();

        let batch = store.list_dispatchable_reports(t0(), 3, 10).await.unwrap();
        assert_eq!(
            batch.iter().map(|r| r.id).collect::<Vec<_>>(),
            [soon.id, late.id]
        );

        soon.attempts = 3;
        soon.state = SubmissionState::Error;
        store.update_report(&soon).await.unwrap();
        let batch = store.list_dispatchable_reports(t0(), 3, 10).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, late.id);
    }

    #[tokio::test]
    async fn test_claim_and_finish_report() {
        let store = SqliteStore::new(test_pool().await);
        let m = manifest("3003", "ABC123");
        store.save_manifest(&m).await.unwrap();
        let report = report_for(&m, 0);
        store.insert_report(&report).await.unwrap();

        assert!(store.claim_report(report.id, t0()).await.unwrap());
        assert!(!store.claim_report(report.id, t0()).await.unwrap());

        let estimated = Fix::new(t0() + Duration::minutes(30), report.arrival.point);
        let accepted = SubmissionOutcome::Accepted {
            confirmation_id: "RAD-9".into(),
        };
        assert!(
            store
                .finish_report(report.id, &accepted, Some(estimated), t0())
                .await
                .unwrap()
        );

        let stored = store.get_report(report.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SubmissionState::Reported);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.confirmation_id.as_deref(), Some("RAD-9"));
        assert_eq!(stored.departure, Some(estimated));
        assert!(stored.departure_estimated);

        // Not sending anymore: a late outcome is discarded.
        let failed = SubmissionOutcome::Failed {
            error: "late".into(),
        };
        assert!(
            !store
                .finish_report(report.id, &failed, None, t0())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_overdue_sweep_and_stale_recovery() {
        let store = SqliteStore::new(test_pool().await);
        let m = manifest("3004", "ABC123");
        store.save_manifest(&m).await.unwrap();

        let expired = report_for(&m, 0);
        store.insert_report(&expired).await.unwrap();
        let stuck = report_for(&m, 1);
        store.insert_report(&stuck).await.unwrap();
        store.claim_report(stuck.id, t0()).await.unwrap();

        let later = t0() + Duration::hours(73);
        assert_eq!(store.mark_overdue_reports(later).await.unwrap(), 1);
        assert_eq!(
            store.get_report(expired.id).await.unwrap().unwrap().state,
            SubmissionState::Overdue
        );

        let recovered = store
            .recover_stale_reports(t0() + Duration::minutes(10), t0() + Duration::minutes(11))
            .await
            .unwrap();
        assert_eq!(recovered, 1);
        let stuck = store.get_report(stuck.id).await.unwrap().unwrap();
        assert_eq!(stuck.state, SubmissionState::Error);
        assert_eq!(stuck.last_error.as_deref(), Some("submission interrupted"));
    }

    #[tokio::test]
    async fn test_exception_lifecycle() {
        let store = SqliteStore::new(test_pool().await);
        let m = manifest("4001", "ABC123");
        store.save_manifest(&m).await.unwrap();

        let ex = ExceptionReport::for_missed_point(
            &m,
            &m.control_points[0],
            ExceptionCode::VehicleNotSeen,
            None,
            t0() + Duration::hours(30),
        )
        .unwrap();
        store.insert_exception(&ex).await.unwrap();
        assert!(store.insert_exception(&ex).await.unwrap_err().is_conflict());

        let found = store
            .find_exception_for_point(m.id, m.control_points[0].id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, ex);

        let now = t0() + Duration::hours(30);
        let batch = store.list_dispatchable_exceptions(now, 3, 20).await.unwrap();
        assert_eq!(batch.len(), 1);

        assert!(store.claim_exception(ex.id, now).await.unwrap());
        let accepted = SubmissionOutcome::Accepted {
            confirmation_id: "NOV-1".into(),
        };
        assert!(store.finish_exception(ex.id, &accepted, now).await.unwrap());
        let stored = store.get_exception(ex.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SubmissionState::Reported);
        assert_eq!(stored.confirmation_id.as_deref(), Some("NOV-1"));
    }

    #[tokio::test]
    async fn test_interaction_log_filter_and_purge() {
        let store = SqliteStore::new(test_pool().await);

        for (i, outcome) in [
            InteractionOutcome::Success,
            InteractionOutcome::Error,
            InteractionOutcome::Timeout,
        ]
        .into_iter()
        .enumerate()
        {
            store
                .record_interaction(&RegulatorInteraction {
                    id: Uuid::new_v4(),
                    occurred_at: t0() - Duration::days(i as i64 * 5),
                    kind: InteractionKind::SubmitReport,
                    endpoint: "http://regulator.test/soap".into(),
                    outcome,
                    duration_ms: 120,
                    request_payload: "<root/>".into(),
                    response_payload: None,
                    metadata: serde_json::json!({ "plate": "ABC123" }),
                })
                .await
                .unwrap();
        }

        let all = store
            .list_interactions(&InteractionFilter::page(10))
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].outcome, InteractionOutcome::Success);
        assert_eq!(all[0].metadata["plate"], "ABC123");

        let errors = store
            .list_interactions(&InteractionFilter {
                outcome: Some(InteractionOutcome::Error),
                ..InteractionFilter::page(10)
            })
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);

        let purged = store
            .purge_interactions(t0() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(purged, 1);
    }

    #[tokio::test]
    async fn test_statistics() {
        let store = SqliteStore::new(test_pool().await);
        let a = manifest("5001", "AAA111");
        let mut b = manifest("5002", "BBB222");
        b.classify(false, false, Some(NotMonitorableReason::not_registered()));
        store.save_manifest(&a).await.unwrap();
        store.save_manifest(&b).await.unwrap();

        let mut r1 = report_for(&a, 0);
        r1.state = SubmissionState::Reported;
        store.insert_report(&r1).await.unwrap();
        store.insert_report(&report_for(&a, 1)).await.unwrap();
        store.insert_report(&report_for(&b, 0)).await.unwrap();

        let all = store.report_counts(None).await.unwrap();
        assert_eq!(all.total(), 3);
        assert_eq!(all.reported, 1);
        assert_eq!(all.pending, 2);

        let only_a = store.report_counts(Some("AAA111")).await.unwrap();
        assert_eq!(only_a.total(), 2);

        let by_plate = store
            .report_counts_by_plate(Page {
                limit: 1,
                offset: 1,
            })
            .await
            .unwrap();
        assert_eq!(by_plate.len(), 1);
        assert_eq!(by_plate[0].plate, "BBB222");
        assert_eq!(by_plate[0].counts.pending, 1);

        let manifests = store.manifest_counts().await.unwrap();
        assert_eq!(manifests.total, 2);
        assert_eq!(manifests.active, 2);
        assert_eq!(manifests.monitorable, 1);
        assert_eq!(manifests.not_monitorable, 1);
        assert_eq!(
            manifests.by_reason,
            vec![(ReasonKind::NotRegistered, 1)]
        );

        assert_eq!(store.exception_counts(None).await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("geocontrol.db");

        let store = SqliteStore::from_path(&path).await.unwrap();
        store.put_setting("k", "v", t0()).await.unwrap();

        assert!(path.exists());
    }
}
