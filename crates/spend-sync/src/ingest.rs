//! Cleaning, hashing and idempotent insertion of fetched rows.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use spend_core::{normalize_record, CanonicalField, CleanedPayment, NormalizedPayment, RawRecord};
use spend_storage::{sha256_hex, PaymentStore, StoreError};
use tracing::{debug, info, warn};

use crate::geocode::GeocodeService;

const HASH_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub inserted: usize,
    /// `rejected_no_date + duplicates`.
    pub skipped: usize,
    pub rejected_no_date: usize,
    pub duplicates: usize,
    pub amounts_defaulted: usize,
}

impl IngestOutcome {
    pub fn absorb(&mut self, other: IngestOutcome) {
        self.inserted += other.inserted;
        self.skipped += other.skipped;
        self.rejected_no_date += other.rejected_no_date;
        self.duplicates += other.duplicates;
        self.amounts_defaulted += other.amounts_defaulted;
    }
}

/// Stable identity of a payment row across fetches.
pub fn payment_hash(payment: &CleanedPayment, payment_date: NaiveDate) -> String {
    // -0.0 and 0.0 must hash alike.
    let amount = if payment.amount_gbp == 0.0 {
        0.0
    } else {
        payment.amount_gbp
    };
    let fields = [
        payment.council.clone(),
        payment_date.format("%Y-%m-%d").to_string(),
        payment.supplier.clone(),
        payment.description.clone(),
        payment.category.clone(),
        format!("{amount:.2}"),
        payment.invoice_ref.clone(),
    ];
    sha256_hex(fields.join(&HASH_SEPARATOR.to_string()).as_bytes())
}

/// Hash a cleaned row into its stored form. Undated rows have no stored form.
pub fn finalize(cleaned: CleanedPayment) -> Option<NormalizedPayment> {
    let payment_date = cleaned.payment_date?;
    let hash = payment_hash(&cleaned, payment_date);
    Some(NormalizedPayment {
        council: cleaned.council,
        payment_date,
        supplier: cleaned.supplier,
        description: cleaned.description,
        category: cleaned.category,
        amount_gbp: cleaned.amount_gbp,
        invoice_ref: cleaned.invoice_ref,
        lat: None,
        lon: None,
        hash,
    })
}

#[derive(Clone)]
pub struct Ingestor {
    store: PaymentStore,
    geocoder: Option<Arc<GeocodeService>>,
}

impl Ingestor {
    pub fn new(store: PaymentStore) -> Self {
        Self {
            store,
            geocoder: None,
        }
    }

    pub fn with_geocoder(mut self, geocoder: Arc<GeocodeService>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn store(&self) -> &PaymentStore {
        &self.store
    }

    /// Clean, hash and insert `records` as one transaction. A storage failure
    /// rolls back the batch and is returned.
    pub async fn insert(&self, records: &[RawRecord], do_geocode: bool) -> Result<IngestOutcome, StoreError> {
        let mut outcome = IngestOutcome::default();
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let cleaned = normalize_record(record);
            if cleaned.was_defaulted(CanonicalField::AmountGbp) {
                outcome.amounts_defaulted += 1;
            }
            match finalize(cleaned) {
                Some(row) => rows.push(row),
                None => outcome.rejected_no_date += 1,
            }
        }

        if do_geocode {
            self.attach_coordinates(&mut rows).await?;
        }

        let written = self.store.insert_batch(&rows).await?;
        outcome.inserted = written.inserted;
        outcome.duplicates = written.skipped;
        outcome.skipped = outcome.rejected_no_date + outcome.duplicates;

        if outcome.rejected_no_date > 0 {
            debug!(rejected = outcome.rejected_no_date, "rows without a usable date were skipped");
        }
        info!(
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            rejected_no_date = outcome.rejected_no_date,
            amounts_defaulted = outcome.amounts_defaulted,
            "ingested batch"
        );
        Ok(outcome)
    }

    /// Geocode suppliers of rows not yet stored; stored rows would be
    /// discarded by the conflict clause anyway.
    async fn attach_coordinates(&self, rows: &mut [NormalizedPayment]) -> Result<(), StoreError> {
        let Some(geocoder) = &self.geocoder else {
            debug!("geocoding requested but no geocoder is configured");
            return Ok(());
        };
        for row in rows.iter_mut() {
            if self.store.contains_hash(&row.hash).await? {
                continue;
            }
            if let Some(coords) = geocoder.coordinates_for(&row.supplier).await {
                row.lat = Some(coords.lat);
                row.lon = Some(coords.lon);
            }
        }
        if let Err(err) = geocoder.flush().await {
            warn!(error = %err, "could not persist geocode cache");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use spend_core::Coordinates;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::geocode::{GeocodeCache, GeocodeError, Geocoder};

    fn record(date: &str, supplier: &str, amount: &str) -> RawRecord {
        RawRecord::new()
            .with(CanonicalField::Council, "Stevenage")
            .with(CanonicalField::PaymentDate, date)
            .with(CanonicalField::Supplier, supplier)
            .with(CanonicalField::Description, "Grounds maintenance")
            .with(CanonicalField::AmountGbp, amount)
            .with(CanonicalField::InvoiceRef, "INV-7")
    }

    #[tokio::test]
    async fn same_record_twice_inserts_once() {
        let ingestor = Ingestor::new(PaymentStore::in_memory().await.unwrap());
        let rows = [record("01/03/2024", "Acme Ltd", "£1,234.50")];

        let first = ingestor.insert(&rows, false).await.unwrap();
        assert_eq!(first.inserted, 1);
        assert_eq!(first.skipped, 0);

        let second = ingestor.insert(&rows, false).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(second.duplicates, 1);
        assert_eq!(ingestor.store().count_payments(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn undated_rows_are_skipped_never_inserted() {
        let ingestor = Ingestor::new(PaymentStore::in_memory().await.unwrap());
        let outcome = ingestor
            .insert(
                &[
                    record("not a date", "Acme Ltd", "10"),
                    record("", "Beta Ltd", "20"),
                    record("2024-03-01", "Gamma Ltd", "N/A"),
                ],
                false,
            )
            .await
            .unwrap();
        assert_eq!(outcome.rejected_no_date, 2);
        assert_eq!(outcome.skipped, 2);
        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.amounts_defaulted, 1);
        assert_eq!(ingestor.store().count_payments(Some("Stevenage")).await.unwrap(), 1);
    }

    #[test]
    fn hash_ignores_source_formatting_of_equal_values() {
        let a = finalize(normalize_record(&record("01/03/2024", " Acme   Ltd", "1234.5"))).unwrap();
        let b = finalize(normalize_record(&record("2024-03-01", "Acme Ltd", "£1,234.50"))).unwrap();
        assert_eq!(a.hash, b.hash);

        let c = finalize(normalize_record(&record("2024-03-01", "Acme Ltd", "1234.51"))).unwrap();
        assert_ne!(a.hash, c.hash);
        assert_eq!(a.hash.len(), 64);
    }

    #[derive(Default)]
    struct FixedGeocoder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Geocoder for FixedGeocoder {
        async fn geocode(&self, _query: &str) -> Result<Option<Coordinates>, GeocodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Coordinates { lat: 51.9, lon: -0.2 }))
        }
    }

    fn geocoding_service(geocoder: Arc<FixedGeocoder>) -> Arc<GeocodeService> {
        Arc::new(GeocodeService::new(
            geocoder,
            GeocodeCache::in_memory(),
            Duration::from_millis(1),
            Duration::from_secs(1),
        ))
    }

    #[tokio::test]
    async fn already_stored_rows_are_not_geocoded() {
        let store = PaymentStore::in_memory().await.unwrap();
        let rows = [record("2024-03-01", "Acme Ltd", "5")];
        Ingestor::new(store.clone()).insert(&rows, false).await.unwrap();

        let geocoder = Arc::new(FixedGeocoder::default());
        let ingestor = Ingestor::new(store).with_geocoder(geocoding_service(geocoder.clone()));
        let outcome = ingestor.insert(&rows, true).await.unwrap();
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn geocoding_fills_coordinates_when_requested() {
        let store = PaymentStore::in_memory().await.unwrap();
        let ingestor = Ingestor::new(store.clone()).with_geocoder(geocoding_service(Arc::default()));
        ingestor
            .insert(&[record("2024-03-01", "Acme Ltd", "5")], true)
            .await
            .unwrap();

        let row = sqlx::query_as::<_, (Option<f64>, Option<f64>)>("SELECT lat, lon FROM payments")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(row, (Some(51.9), Some(-0.2)));
    }
}
