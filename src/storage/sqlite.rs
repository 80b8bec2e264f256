//! SQLite storage backend implementation
//!
//! Embedded single-file store, the default for standalone deployments.
//! WAL mode keeps reads usable while samples are being written; each upsert
//! is its own implicit transaction, so unrelated hosts never queue behind a
//! global write lock held across the network.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::DateTime;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};

use super::backend::{HealthStatus, StorageBackend};
use super::error::{StorageError, StorageResult};
use super::schema::HostRow;

/// SQLite host-record store.
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Open (creating if missing) the database file and run migrations.
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StorageError::MigrationFailed(e.to_string()))?;

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn row_from_sqlite(row: &sqlx::sqlite::SqliteRow) -> HostRow {
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
impl StorageBackend for SqliteBackend {
    async fn load(&self, oid: i64) -> StorageResult<Option<HostRow>> {
        let row = sqlx::query(
            "SELECT oid, name, body, last_mon_time FROM host_records WHERE oid = ?",
        )
        .bind(oid)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::row_from_sqlite))
    }

    #[instrument(skip(self, row), fields(oid = row.oid))]
    async fn upsert(&self, row: HostRow) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO host_records (oid, name, body, last_mon_time)
            VALUES (?, ?, ?, ?)
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

        Ok(rows.iter().map(Self::row_from_sqlite).collect())
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM host_records")
            .fetch_one(&self.pool)
            .await?;

        Ok(HealthStatus {
            healthy: true,
            message: format!("SQLite: {count} host records"),
            metadata: HashMap::from([
                ("backend".to_string(), "sqlite".to_string()),
                ("path".to_string(), self.db_path.clone()),
                ("records".to_string(), count.to_string()),
            ]),
        })
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}
