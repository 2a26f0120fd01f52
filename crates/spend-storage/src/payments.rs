//! SQLite payments store. The unique `hash` column is the only arbiter of
//! duplicate rows; concurrent writers race on the constraint, not on locks.

use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use spend_core::NormalizedPayment;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertOutcome {
    pub inserted: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct PaymentStore {
    pool: SqlitePool,
}

impl PaymentStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(10));
        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Private in-memory database, migrated and ready.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let store = Self::connect("sqlite::memory:").await?;
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("payments schema is up to date");
        Ok(())
    }

    /// Insert a batch atomically. Rows whose hash already exists are skipped.
    /// Any other failure rolls back the whole batch.
    pub async fn insert_batch(&self, rows: &[NormalizedPayment]) -> Result<InsertOutcome, StoreError> {
        let mut outcome = InsertOutcome::default();
        if rows.is_empty() {
            return Ok(outcome);
        }

        let mut tx = self.pool.begin().await?;
        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO payments
                    (council, payment_date, supplier, description, category,
                     amount_gbp, invoice_ref, lat, lon, hash)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(hash) DO NOTHING
                "#,
            )
            .bind(&row.council)
            .bind(row.payment_date)
            .bind(&row.supplier)
            .bind(&row.description)
            .bind(&row.category)
            .bind(row.amount_gbp)
            .bind(&row.invoice_ref)
            .bind(row.lat)
            .bind(row.lon)
            .bind(&row.hash)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                outcome.inserted += 1;
            } else {
                outcome.skipped += 1;
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn contains_hash(&self, hash: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM payments WHERE hash = ?1")
            .bind(hash)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n > 0)
    }

    pub async fn count_payments(&self, council: Option<&str>) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM payments WHERE (?1 IS NULL OR council = ?1)",
        )
        .bind(council)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    /// Distinct council names with at least one stored payment, alphabetical.
    pub async fn councils(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT council FROM payments ORDER BY council ASC")
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get("council")?);
        }
        Ok(out)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
