//! PostgreSQL storage backend implementation
//!
//! Networked relational store for deployments where the monitor daemon
//! shares a database with the rest of the platform. Same contract and row
//! shape as the SQLite backend; selected via the `storage` config section.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, info, instrument};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::HostRow;

/// PostgreSQL host-record store.
pub struct PostgresBackend {
    pool: Pool<Postgres>,
}

impl PostgresBackend {
    /// Connect to the given database URL and run migrations.
    #[instrument(skip_all)]
    pub async fn new(url: &str, max_connections: u32) -> StorageResult<Self> {
        info!("initializing PostgreSQL backend");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    fn row_from_pg(row: &sqlx::postgres::PgRow) -> HostRow {
        let millis: i64 = row.get("last_mon_time");
        HostRow {
            oid: row.get("oid"),
            name: row.get("name"),
            body: row.get("body"),
            last_mon_time: DateTime::from_timestamp_millis(millis).unwrap_or_default(),
        }
    }
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    async fn load(&self, oid: i64) -> StorageResult<Option<HostRow>> {
        let row = sqlx::query(
            "SELECT oid, name, body, last_mon_time FROM host_records WHERE oid = $1",
        )
        .bind(oid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::row_from_pg))
    }

    #[instrument(skip(self, row), fields(oid = row.oid))]
    async fn upsert(&self, row: HostRow) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO host_records (oid, name, body, last_mon_time)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (oid) DO UPDATE SET
                name = excluded.name,
                body = excluded.body,
                last_mon_time = excluded.last_mon_time
            "#,
        )
        .bind(row.oid)
        .bind(&row.name)
        .bind(&row.body)
        .bind(row.last_mon_time.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn scan(&self) -> StorageResult<Vec<HostRow>> {
        let rows =
            sqlx::query("SELECT oid, name, body, last_mon_time FROM host_records ORDER BY oid")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.iter().map(Self::row_from_pg).collect())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM host_records")
            .fetch_one(&self.pool)
            .await?;

        Ok(HealthStatus {
            healthy: true,
            message: format!("PostgreSQL: {count} host records"),
            metadata: HashMap::from([
                ("backend".to_string(), "postgres".to_string()),
                ("records".to_string(), count.to_string()),
            ]),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing PostgreSQL backend");
        self.pool.close().await;
        Ok(())
    }
}
