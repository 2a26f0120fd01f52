//! Read-only anomaly queries over stored payments.
//!
//! Every query is independent and optionally scoped to one council. An empty
//! result means no anomaly of that kind.

use chrono::NaiveDate;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::payments::{PaymentStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnomalyThresholds {
    /// Payments strictly above this amount are flagged.
    pub large_payment_gbp: f64,
    /// Supplier-months with strictly more payments than this are flagged.
    pub frequent_payments_per_month: i64,
    /// Suppliers above this share of a council's spend are flagged.
    pub dominance_share: f64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            large_payment_gbp: 100_000.0,
            frequent_payments_per_month: 5,
            dominance_share: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LargePayment {
    pub id: i64,
    pub council: String,
    pub payment_date: NaiveDate,
    pub supplier: String,
    pub amount_gbp: f64,
    pub invoice_ref: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrequentSupplier {
    pub council: String,
    pub supplier: String,
    /// `YYYY-MM`
    pub month: String,
    pub payment_count: i64,
    pub total_gbp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateInvoice {
    pub council: String,
    pub invoice_ref: String,
    pub payment_count: i64,
    pub total_gbp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingInvoice {
    pub id: i64,
    pub council: String,
    pub payment_date: NaiveDate,
    pub supplier: String,
    pub amount_gbp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupplierDominance {
    pub council: String,
    pub supplier: String,
    pub supplier_total_gbp: f64,
    pub council_total_gbp: f64,
    pub share_percent: f64,
}

#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    pool: SqlitePool,
    thresholds: AnomalyThresholds,
}

impl AnomalyDetector {
    pub fn new(store: &PaymentStore) -> Self {
        Self::with_thresholds(store, AnomalyThresholds::default())
    }

    pub fn with_thresholds(store: &PaymentStore, thresholds: AnomalyThresholds) -> Self {
        Self {
            pool: store.pool().clone(),
            thresholds,
        }
    }

    pub fn thresholds(&self) -> AnomalyThresholds {
        self.thresholds
    }

    pub async fn large_payments(&self, council: Option<&str>) -> Result<Vec<LargePayment>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, council, payment_date, supplier, amount_gbp, invoice_ref
              FROM payments
             WHERE amount_gbp > ?1
               AND (?2 IS NULL OR council = ?2)
             ORDER BY amount_gbp DESC, payment_date DESC, id ASC
            "#,
        )
        .bind(self.thresholds.large_payment_gbp)
        .bind(council)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(LargePayment {
                id: row.try_get("id")?,
                council: row.try_get("council")?,
                payment_date: row.try_get("payment_date")?,
                supplier: row.try_get("supplier")?,
                amount_gbp: row.try_get("amount_gbp")?,
                invoice_ref: row.try_get("invoice_ref")?,
            });
        }
        Ok(out)
    }

    pub async fn frequent_payments(
        &self,
        council: Option<&str>,
    ) -> Result<Vec<FrequentSupplier>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT council,
                   supplier,
                   substr(payment_date, 1, 7) AS month,
                   COUNT(*) AS payment_count,
                   SUM(amount_gbp) AS total_gbp
              FROM payments
             WHERE (?2 IS NULL OR council = ?2)
             GROUP BY council, supplier, month
            HAVING COUNT(*) > ?1
             ORDER BY payment_count DESC, total_gbp DESC, council, supplier, month
            "#,
        )
        .bind(self.thresholds.frequent_payments_per_month)
        .bind(council)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(FrequentSupplier {
                council: row.try_get("council")?,
                supplier: row.try_get("supplier")?,
                month: row.try_get("month")?,
                payment_count: row.try_get("payment_count")?,
                total_gbp: row.try_get("total_gbp")?,
            });
        }
        Ok(out)
    }

    pub async fn duplicate_invoices(
        &self,
        council: Option<&str>,
    ) -> Result<Vec<DuplicateInvoice>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT council,
                   invoice_ref,
                   COUNT(*) AS payment_count,
                   SUM(amount_gbp) AS total_gbp
              FROM payments
             WHERE invoice_ref IS NOT NULL
               AND trim(invoice_ref) <> ''
               AND (?1 IS NULL OR council = ?1)
             GROUP BY council, invoice_ref
            HAVING COUNT(*) > 1
             ORDER BY payment_count DESC, total_gbp DESC, council, invoice_ref
            "#,
        )
        .bind(council)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(DuplicateInvoice {
                council: row.try_get("council")?,
                invoice_ref: row.try_get("invoice_ref")?,
                payment_count: row.try_get("payment_count")?,
                total_gbp: row.try_get("total_gbp")?,
            });
        }
        Ok(out)
    }

    pub async fn missing_invoices(
        &self,
        council: Option<&str>,
    ) -> Result<Vec<MissingInvoice>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, council, payment_date, supplier, amount_gbp
              FROM payments
             WHERE (invoice_ref IS NULL OR trim(invoice_ref) = '')
               AND (?1 IS NULL OR council = ?1)
             ORDER BY payment_date DESC, id DESC
            "#,
        )
        .bind(council)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(MissingInvoice {
                id: row.try_get("id")?,
                council: row.try_get("council")?,
                payment_date: row.try_get("payment_date")?,
                supplier: row.try_get("supplier")?,
                amount_gbp: row.try_get("amount_gbp")?,
            });
        }
        Ok(out)
    }

    /// At most one supplier per council can exceed a share above one half;
    /// lower thresholds may surface several, ordered by spend.
    pub async fn supplier_dominance(
        &self,
        council: Option<&str>,
    ) -> Result<Vec<SupplierDominance>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH totals AS (
                SELECT council, SUM(amount_gbp) AS council_total
                  FROM payments
                 WHERE (?2 IS NULL OR council = ?2)
                 GROUP BY council
            ),
            by_supplier AS (
                SELECT council, supplier, SUM(amount_gbp) AS supplier_total
                  FROM payments
                 WHERE (?2 IS NULL OR council = ?2)
                 GROUP BY council, supplier
            )
            SELECT s.council AS council,
                   s.supplier AS supplier,
                   s.supplier_total AS supplier_total,
                   t.council_total AS council_total
              FROM by_supplier s
              JOIN totals t ON t.council = s.council
             WHERE t.council_total > 0
               AND s.supplier_total > t.council_total * ?1
             ORDER BY s.council, s.supplier_total DESC
            "#,
        )
        .bind(self.thresholds.dominance_share)
        .bind(council)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let supplier_total: f64 = row.try_get("supplier_total")?;
            let council_total: f64 = row.try_get("council_total")?;
            out.push(SupplierDominance {
                council: row.try_get("council")?,
                supplier: row.try_get("supplier")?,
                supplier_total_gbp: supplier_total,
                council_total_gbp: council_total,
                share_percent: supplier_total * 100.0 / council_total,
            });
        }
        Ok(out)
    }
}

/// All five anomaly sets for one scope.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnomalyReport {
    pub council: Option<String>,
    pub large_payments: Vec<LargePayment>,
    pub frequent_payments: Vec<FrequentSupplier>,
    pub duplicate_invoices: Vec<DuplicateInvoice>,
    pub missing_invoices: Vec<MissingInvoice>,
    pub supplier_dominance: Vec<SupplierDominance>,
}

impl AnomalyReport {
    pub async fn run(detector: &AnomalyDetector, council: Option<&str>) -> Result<Self, StoreError> {
        Ok(Self {
            council: council.map(ToString::to_string),
            large_payments: detector.large_payments(council).await?,
            frequent_payments: detector.frequent_payments(council).await?,
            duplicate_invoices: detector.duplicate_invoices(council).await?,
            missing_invoices: detector.missing_invoices(council).await?,
            supplier_dominance: detector.supplier_dominance(council).await?,
        })
    }

    pub fn is_clean(&self) -> bool {
        self.large_payments.is_empty()
            && self.frequent_payments.is_empty()
            && self.duplicate_invoices.is_empty()
            && self.missing_invoices.is_empty()
            && self.supplier_dominance.is_empty()
    }
}
