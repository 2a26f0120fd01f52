//! Core domain model for council spending ingestion.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub mod clean;

pub use clean::{normalize_record, Cleaned, DefaultReason};

pub const CRATE_NAME: &str = "spend-core";

/// Canonical keys every fetcher translates upstream columns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Council,
    PaymentDate,
    Supplier,
    Description,
    Category,
    AmountGbp,
    InvoiceRef,
}

impl CanonicalField {
    /// Fields recovered from upstream headers. `Council` is stamped by the fetcher.
    pub const MAPPED: [CanonicalField; 6] = [
        CanonicalField::PaymentDate,
        CanonicalField::Supplier,
        CanonicalField::Description,
        CanonicalField::Category,
        CanonicalField::AmountGbp,
        CanonicalField::InvoiceRef,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalField::Council => "council",
            CanonicalField::PaymentDate => "payment_date",
            CanonicalField::Supplier => "supplier",
            CanonicalField::Description => "description",
            CanonicalField::Category => "category",
            CanonicalField::AmountGbp => "amount_gbp",
            CanonicalField::InvoiceRef => "invoice_ref",
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cell of an upstream row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RawValue {
    Text(String),
    Number(f64),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Blank,
}

impl RawValue {
    /// Blank cells (empty or whitespace-only) become `Blank`, everything else `Text`.
    pub fn from_cell(cell: &str) -> Self {
        if cell.trim().is_empty() {
            RawValue::Blank
        } else {
            RawValue::Text(cell.to_string())
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            RawValue::Blank => true,
            RawValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        RawValue::Text(value)
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

impl From<NaiveDate> for RawValue {
    fn from(value: NaiveDate) -> Self {
        RawValue::Date(value)
    }
}

/// An upstream row, keyed by canonical field name once a fetcher has mapped it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    fields: BTreeMap<String, RawValue>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: CanonicalField, value: impl Into<RawValue>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: CanonicalField, value: impl Into<RawValue>) {
        self.fields.insert(field.as_str().to_string(), value.into());
    }

    pub fn insert_raw(&mut self, key: impl Into<String>, value: RawValue) {
        self.fields.insert(key.into(), value);
    }

    pub fn get(&self, field: CanonicalField) -> Option<&RawValue> {
        self.fields.get(field.as_str())
    }

    pub fn get_raw(&self, key: &str) -> Option<&RawValue> {
        self.fields.get(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when no mapped business field carries a value.
    pub fn is_blank_row(&self) -> bool {
        CanonicalField::MAPPED
            .iter()
            .all(|f| self.get(*f).map_or(true, RawValue::is_blank))
    }
}

/// A field the cleaner could not parse and replaced with a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefault {
    pub field: CanonicalField,
    pub reason: DefaultReason,
}

/// Cleaner output before hashing and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanedPayment {
    pub council: String,
    pub payment_date: Option<NaiveDate>,
    pub supplier: String,
    pub description: String,
    pub category: String,
    pub amount_gbp: f64,
    pub invoice_ref: String,
    pub defaults: Vec<FieldDefault>,
}

impl CleanedPayment {
    pub fn was_defaulted(&self, field: CanonicalField) -> bool {
        self.defaults.iter().any(|d| d.field == field)
    }
}

/// Canonical persisted payment row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedPayment {
    pub council: String,
    pub payment_date: NaiveDate,
    pub supplier: String,
    pub description: String,
    pub category: String,
    pub amount_gbp: f64,
    pub invoice_ref: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub hash: String,
}

/// Coordinates returned by the geocoding collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

/// A discovered `(council, resource url)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub council: String,
    pub url: String,
}

impl SourceRef {
    pub fn new(council: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            council: council.into(),
            url: url.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_record_is_keyed_by_canonical_names() {
        let record = RawRecord::new()
            .with(CanonicalField::Supplier, "Acme Ltd")
            .with(CanonicalField::AmountGbp, 12.5);
        assert_eq!(
            record.get_raw("supplier"),
            Some(&RawValue::Text("Acme Ltd".into()))
        );
        assert_eq!(record.get(CanonicalField::AmountGbp), Some(&RawValue::Number(12.5)));
        assert!(record.get(CanonicalField::InvoiceRef).is_none());
    }

    #[test]
    fn blank_row_ignores_council_stamp() {
        let record = RawRecord::new()
            .with(CanonicalField::Council, "Durham")
            .with(CanonicalField::Supplier, RawValue::from_cell("   "));
        assert!(record.is_blank_row());

        let record = record.with(CanonicalField::AmountGbp, "1.00");
        assert!(!record.is_blank_row());
    }
}
