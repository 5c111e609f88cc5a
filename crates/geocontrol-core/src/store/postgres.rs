// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed store implementation.
//!
//! Claims and outcomes are conditional updates on `state`; several workers
//! may share one database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
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

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;

        migrations::POSTGRES.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn load_points(&self, manifest_id: &str) -> Result<Vec<ControlPoint>> {
        let sql = format!(
            "SELECT {CONTROL_POINT_COLUMNS} FROM control_points WHERE manifest_id = $1 ORDER BY code"
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
        let sql = format!("SELECT {MANIFEST_COLUMNS} FROM manifests WHERE {column} = $1");
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
                    format!("SELECT state, COUNT(*) FROM {table} WHERE plate = $1 GROUP BY state");
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
    tx: &mut Transaction<'_, Postgres>,
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
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
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
impl Store for PostgresStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put_setting(&self, key: &str, value: &str, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES ($1, $2, $3)
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

        let exists = sqlx::query_scalar::<_, String>("SELECT id FROM manifests WHERE id = $1")
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();

        let outcome = if exists {
            sqlx::query(
                r#"
                UPDATE manifests
                SET number = $1, carrier_tax_id = $2, plate = $3, issued_on = $4, state = $5,
                    vehicle_authorized = $6, monitorable = $7, reason_kind = $8, reason_detail = $9,
                    updated_at = $10
                WHERE id = $11
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
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
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
            sqlx::query_scalar("SELECT id FROM control_points WHERE manifest_id = $1")
                .bind(&id)
                .fetch_all(&mut *tx)
                .await?;
        let keep: Vec<String> = manifest
            .control_points
            .iter()
            .map(|p| p.id.to_string())
            .collect();

        for stale in stored.iter().filter(|s| !keep.contains(s)) {
            sqlx::query("DELETE FROM control_points WHERE id = $1")
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
        sqlx::query("UPDATE control_points SET confirmation_id = $1 WHERE id = $2")
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
                SET state = $1, arrival_at = $2, arrival_latitude = $3, arrival_longitude = $4,
                    departure_at = $5, departure_latitude = $6, departure_longitude = $7,
                    no_departure = $8, report_id = $9
                WHERE id = $10 AND manifest_id = $11
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
            SET state = COALESCE($1, state), updated_at = $2
            WHERE id = $3
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)
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
        let sql = format!("SELECT {REPORT_COLUMNS} FROM reports WHERE id = $1");
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
             WHERE manifest_id = $1 AND control_point_id = $2 AND state <> 'annulled'"
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
            SET departure_at = $1, departure_latitude = $2, departure_longitude = $3,
                departure_estimated = $4, no_departure = $5, state = $6, attempts = $7,
                last_attempt_at = $8, confirmation_id = $9, last_error = $10, updated_at = $11
            WHERE id = $12
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
             WHERE state IN ('pending', 'error') AND deadline > $1 AND attempts < $2 \
             ORDER BY deadline ASC LIMIT $3"
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
            SET state = 'sending', attempts = attempts + 1, last_attempt_at = $1, updated_at = $2
            WHERE id = $3 AND state IN ('pending', 'error')
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
                    SET state = 'reported', confirmation_id = $1, last_error = NULL,
                        departure_at = $2, departure_latitude = $3, departure_longitude = $4,
                        departure_estimated = TRUE, updated_at = $5
                    WHERE id = $6 AND state = 'sending'
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
                    SET state = 'reported', confirmation_id = $1, last_error = NULL, updated_at = $2
                    WHERE id = $3 AND state = 'sending'
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
                    SET state = 'error', last_error = $1, updated_at = $2
                    WHERE id = $3 AND state = 'sending'
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
            SET state = 'overdue', updated_at = $1
            WHERE state IN ('pending', 'error') AND deadline < $2
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
            SET state = 'error', last_error = 'submission interrupted', updated_at = $1
            WHERE state = 'sending' AND last_attempt_at < $2
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
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
        let sql = format!("SELECT {EXCEPTION_COLUMNS} FROM exception_reports WHERE id = $1");
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
             WHERE manifest_id = $1 AND control_point_id = $2"
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
            SET detail = $1, state = $2, attempts = $3, last_attempt_at = $4,
                confirmation_id = $5, last_error = $6, updated_at = $7
            WHERE id = $8
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
             WHERE state IN ('pending', 'error') AND deadline > $1 AND attempts < $2 \
             ORDER BY deadline ASC LIMIT $3"
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
            SET state = 'sending', attempts = attempts + 1, last_attempt_at = $1, updated_at = $2
            WHERE id = $3 AND state IN ('pending', 'error')
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
                SET state = 'reported', confirmation_id = $1, last_error = NULL, updated_at = $2
                WHERE id = $3 AND state = 'sending'
                "#,
            )
            .bind(confirmation_id),
            SubmissionOutcome::Failed { error } => sqlx::query(
                r#"
                UPDATE exception_reports
                SET state = 'error', last_error = $1, updated_at = $2
                WHERE id = $3 AND state = 'sending'
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
            SET state = 'overdue', updated_at = $1
            WHERE state IN ('pending', 'error') AND deadline < $2
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
            SET state = 'error', last_error = 'submission interrupted', updated_at = $1
            WHERE state = 'sending' AND last_attempt_at < $2
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
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
             WHERE ($1::text IS NULL OR outcome = $2) AND ($3::text IS NULL OR kind = $4) \
             ORDER BY occurred_at DESC LIMIT $5 OFFSET $6"
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
        let result = sqlx::query("DELETE FROM regulator_interactions WHERE occurred_at < $1")
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
                SELECT plate FROM reports GROUP BY plate ORDER BY plate LIMIT $1 OFFSET $2
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
