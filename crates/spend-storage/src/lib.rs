//! HTTP fetch utilities and the persistent payments store.

use sha2::{Digest, Sha256};

pub mod anomalies;
pub mod http;
pub mod payments;

pub use anomalies::{
    AnomalyDetector, AnomalyReport, AnomalyThresholds, DuplicateInvoice, FrequentSupplier,
    LargePayment, MissingInvoice, SupplierDominance,
};
pub use http::{
    is_transient_status, resolve_link, url_with_params, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, RequestPacer, RetryPolicy,
};
pub use payments::{InsertOutcome, PaymentStore, StoreError};
pub use reqwest::StatusCode;

pub const CRATE_NAME: &str = "spend-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_is_lowercase_hex() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
