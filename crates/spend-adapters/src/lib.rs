//! Council source fetchers: the generic CSV fetcher with alias-based column
//! mapping, per-council overrides, and the registry that picks between them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};
use spend_core::{CanonicalField, RawRecord, RawValue};
use spend_storage::{FetchError, FetchedResponse, HttpFetcher};
use strsim::jaro_winkler;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub mod catalog;
pub mod councils;

pub use catalog::{
    build_catalog, Catalog, CatalogBuild, CatalogCache, CatalogEntry, CatalogError, CatalogOptions,
    CkanSearchClient, DiscoveryPager, PageOutcome, SearchBackend,
};
pub use councils::{builtin_registry, load_registry, IndexPageFetcher, StaticCsvFetcher};

pub const CRATE_NAME: &str = "spend-adapters";

/// Council names at or above this Jaro-Winkler score share an override.
const COUNCIL_MATCH_THRESHOLD: f64 = 0.97;

/// Words that vary between catalog publisher names and override names.
const COUNCIL_NAME_NOISE: [&str; 8] = [
    "council",
    "city",
    "borough",
    "district",
    "county",
    "metropolitan",
    "of",
    "the",
];

const SNIPPET_CHARS: usize = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{url} is not tabular data (content type {content_type:?})")]
    NotTabular {
        url: String,
        content_type: Option<String>,
        snippet: String,
    },
    #[error("could not parse {url} as delimited text: {message}")]
    Parse { url: String, message: String },
    #[error("index page {url} links to no CSV files")]
    NoLinks { url: String },
    #[error("all {files} linked files failed for {council}; last error: {last}")]
    AllFilesFailed {
        council: String,
        files: usize,
        last: Box<AdapterError>,
    },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    /// Short machine-friendly label used in failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::Fetch(FetchError::HttpStatus { .. }) => "http_status",
            AdapterError::Fetch(err) if err.is_timeout() => "http_timeout",
            AdapterError::Fetch(_) => "request",
            AdapterError::NotTabular { .. } => "not_tabular",
            AdapterError::Parse { .. } => "parse",
            AdapterError::NoLinks { .. } => "no_links",
            AdapterError::AllFilesFailed { .. } => "all_files_failed",
            AdapterError::Message(_) | AdapterError::Anyhow(_) => "other",
        }
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            AdapterError::Fetch(err) => err.status(),
            AdapterError::AllFilesFailed { last, .. } => last.http_status(),
            _ => None,
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        match self {
            AdapterError::NotTabular { content_type, .. } => content_type.as_deref(),
            AdapterError::AllFilesFailed { last, .. } => last.content_type(),
            _ => None,
        }
    }

    pub fn snippet(&self) -> Option<&str> {
        match self {
            AdapterError::NotTabular { snippet, .. } => Some(snippet.as_str()),
            AdapterError::AllFilesFailed { last, .. } => last.snippet(),
            _ => None,
        }
    }
}

/// A per-council strategy that owns the whole fetch for its council.
#[async_trait]
pub trait CouncilFetcher: Send + Sync {
    fn council(&self) -> &str;

    /// Primary URL this fetcher reads from, for logging and failure reports.
    fn origin(&self) -> &str;

    async fn fetch_records(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawRecord>, AdapterError>;
}

/// Ordered header aliases per mapped canonical field. The first alias with a
/// matching header wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnAliases {
    fields: BTreeMap<CanonicalField, Vec<String>>,
}

impl Default for ColumnAliases {
    fn default() -> Self {
        let table: [(CanonicalField, &[&str]); 6] = [
            (
                CanonicalField::PaymentDate,
                &[
                    "Payment Date",
                    "PaymentDate",
                    "Date",
                    "Date Paid",
                    "Paid Date",
                    "Transaction Date",
                    "Invoice Date",
                    "Posting Date",
                ],
            ),
            (
                CanonicalField::Supplier,
                &[
                    "Supplier Name",
                    "Supplier",
                    "SupplierName",
                    "Payee",
                    "Payee Name",
                    "Vendor",
                    "Vendor Name",
                    "Beneficiary",
                    "Merchant Name",
                ],
            ),
            (
                CanonicalField::Description,
                &[
                    "Description",
                    "Purpose",
                    "Expense Description",
                    "Expenditure Description",
                    "Narrative",
                    "Details",
                    "Expense Type",
                    "Purpose of Spend",
                ],
            ),
            (
                CanonicalField::Category,
                &[
                    "Department",
                    "Service Area",
                    "ServiceArea",
                    "Service",
                    "Directorate",
                    "Expense Area",
                    "Category",
                    "Service Division",
                ],
            ),
            (
                CanonicalField::AmountGbp,
                &[
                    "Amount",
                    "Amount Paid",
                    "AmountPaid",
                    "Net Amount",
                    "Value",
                    "Amount (£)",
                    "Amount £",
                    "Total",
                    "Gross Amount",
                    "Net Value",
                ],
            ),
            (
                CanonicalField::InvoiceRef,
                &[
                    "Invoice Ref",
                    "InvoiceRef",
                    "Invoice Reference",
                    "Invoice Number",
                    "InvoiceNumber",
                    "Invoice No",
                    "Transaction Number",
                    "TransactionNumber",
                    "Transaction ID",
                    "Reference",
                ],
            ),
        ];
        Self {
            fields: table
                .into_iter()
                .map(|(field, aliases)| (field, aliases.iter().map(|a| a.to_string()).collect()))
                .collect(),
        }
    }
}

impl ColumnAliases {
    pub fn aliases(&self, field: CanonicalField) -> &[String] {
        self.fields.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Put council-specific aliases ahead of the defaults for `field`.
    pub fn prepend<I, S>(mut self, field: CanonicalField, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut merged: Vec<String> = aliases.into_iter().map(Into::into).collect();
        let existing = self.fields.remove(&field).unwrap_or_default();
        for alias in existing {
            if !merged.iter().any(|m| header_key(m) == header_key(&alias)) {
                merged.push(alias);
            }
        }
        self.fields.insert(field, merged);
        self
    }

    pub fn resolve(&self, headers: &[String]) -> ColumnMapping {
        let keys: Vec<String> = headers.iter().map(|h| header_key(h)).collect();
        let mut indices = BTreeMap::new();
        for field in CanonicalField::MAPPED {
            let found = self
                .aliases(field)
                .iter()
                .find_map(|alias| {
                    let wanted = header_key(alias);
                    keys.iter().position(|k| *k == wanted)
                });
            if let Some(idx) = found {
                indices.insert(field, idx);
            }
        }
        ColumnMapping { indices }
    }
}

/// Comparison key for headers: trimmed, BOM-free, lowercased, single-spaced.
fn header_key(header: &str) -> String {
    header
        .trim_start_matches('\u{feff}')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Resolved header positions for one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    indices: BTreeMap<CanonicalField, usize>,
}

impl ColumnMapping {
    pub fn column_for(&self, field: CanonicalField) -> Option<usize> {
        self.indices.get(&field).copied()
    }

    pub fn mapped_fields(&self) -> usize {
        self.indices.len()
    }

    pub fn apply(&self, council: &str, row: &[String]) -> RawRecord {
        let mut record = RawRecord::new().with(CanonicalField::Council, council);
        for (field, idx) in &self.indices {
            let value = row
                .get(*idx)
                .map(|cell| RawValue::from_cell(cell))
                .unwrap_or(RawValue::Blank);
            record.insert(*field, value);
        }
        record
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Latin1,
}

/// Decode as UTF-8 (dropping a BOM), falling back to Latin-1.
pub fn decode_text(bytes: &[u8]) -> (String, TextEncoding) {
    let bytes = bytes.strip_prefix(b"\xef\xbb\xbf").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), TextEncoding::Utf8),
        Err(_) => (bytes.iter().map(|&b| char::from(b)).collect(), TextEncoding::Latin1),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub delimiter: u8,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    fn looks_semicolon_delimited(&self) -> bool {
        self.headers.len() == 1 && self.headers[0].contains(';')
    }

    /// Map rows onto canonical fields, stamping `council`. Blank rows are dropped.
    pub fn into_records(self, council: &str, aliases: &ColumnAliases) -> Vec<RawRecord> {
        let mapping = aliases.resolve(&self.headers);
        debug!(
            council,
            mapped = mapping.mapped_fields(),
            rows = self.rows.len(),
            "mapped columns"
        );
        let decimal_comma = self.delimiter == b';';
        self.rows
            .iter()
            .map(|row| {
                let mut record = mapping.apply(council, row);
                if decimal_comma {
                    rewrite_decimal_comma(&mut record);
                }
                record
            })
            .filter(|record| !record.is_blank_row())
            .collect()
    }
}

/// Continental amount notation (`1.234,50`, `1200,00`) as `1234.50`. Only a
/// comma followed by one or two trailing digits counts as a decimal mark.
pub fn decimal_comma_amount(cell: &str) -> Option<String> {
    let trimmed = cell.trim();
    let (whole, fraction) = trimmed.rsplit_once(',')?;
    if fraction.is_empty() || fraction.len() > 2 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !whole.bytes().any(|b| b.is_ascii_digit()) || whole.contains(',') {
        return None;
    }
    let whole: String = whole.chars().filter(|c| *c != '.' && !c.is_whitespace()).collect();
    Some(format!("{whole}.{fraction}"))
}

fn rewrite_decimal_comma(record: &mut RawRecord) {
    let rewritten = match record.get(CanonicalField::AmountGbp) {
        Some(RawValue::Text(text)) => decimal_comma_amount(text),
        _ => None,
    };
    if let Some(amount) = rewritten {
        record.insert(CanonicalField::AmountGbp, amount);
    }
}

fn parse_with(text: &str, delimiter: u8, flexible: bool) -> Result<Table, csv::Error> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(flexible)
        .from_reader(text.as_bytes());
    let headers = reader.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(str::to_string).collect());
    }
    Ok(Table {
        delimiter,
        headers,
        rows,
    })
}

/// Parse comma-delimited text, falling back to semicolons on structural
/// failure and finally to a lenient comma parse that tolerates ragged rows.
pub fn parse_delimited(text: &str) -> Result<Table, csv::Error> {
    let comma = parse_with(text, b',', false);
    if let Ok(table) = &comma {
        if !table.looks_semicolon_delimited() {
            return comma;
        }
    }
    if let Ok(table) = parse_with(text, b';', false) {
        if table.headers.len() > 1 {
            return Ok(table);
        }
    }
    match comma {
        Ok(table) => Ok(table),
        Err(_) => parse_with(text, b',', true),
    }
}

fn looks_like_markup(body: &[u8]) -> bool {
    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    let head: Vec<u8> = body[start..]
        .iter()
        .take(16)
        .map(u8::to_ascii_lowercase)
        .collect();
    head.starts_with(b"<!doctype")
        || head.starts_with(b"<html")
        || head.starts_with(b"<?xml")
        || head.starts_with(b"pk\x03\x04")
}

/// Reject responses that are not delimited text, such as an HTML error page
/// served with status 200.
pub fn ensure_tabular(response: &FetchedResponse) -> Result<(), AdapterError> {
    let content_type = response.content_type.as_deref().unwrap_or_default();
    let declared_markup = ["text/html", "application/xhtml", "application/json", "application/xml"]
        .iter()
        .any(|t| content_type.contains(t));
    if declared_markup || looks_like_markup(&response.body) {
        return Err(AdapterError::NotTabular {
            url: response.final_url.clone(),
            content_type: response.content_type.clone(),
            snippet: response.snippet(SNIPPET_CHARS),
        });
    }
    Ok(())
}

/// Turn a fetched response into canonical raw records.
pub fn records_from_response(
    response: &FetchedResponse,
    council: &str,
    aliases: &ColumnAliases,
) -> Result<Vec<RawRecord>, AdapterError> {
    ensure_tabular(response)?;
    let (text, encoding) = decode_text(&response.body);
    if encoding == TextEncoding::Latin1 {
        debug!(url = %response.final_url, "decoded as latin-1");
    }
    let table = parse_delimited(&text).map_err(|e| AdapterError::Parse {
        url: response.final_url.clone(),
        message: e.to_string(),
    })?;
    Ok(table.into_records(council, aliases))
}

/// Fallback fetcher for any CSV URL without a council override.
#[derive(Debug, Clone, Default)]
pub struct GenericCsvFetcher {
    aliases: ColumnAliases,
}

impl GenericCsvFetcher {
    pub fn new(aliases: ColumnAliases) -> Self {
        Self { aliases }
    }

    pub fn aliases(&self) -> &ColumnAliases {
        &self.aliases
    }

    pub async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        council: &str,
        url: &str,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let response = http.fetch_bytes(ctx.run_id, council, url).await?;
        records_from_response(&response, council, &self.aliases)
    }
}

/// Identity key for council names: lowercase words with the administrative
/// noise ("City", "Borough Council", ...) removed.
pub fn council_key(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .filter(|w| !COUNCIL_NAME_NOISE.contains(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Injected mapping from council identity to a custom fetcher, with the
/// generic CSV fetcher as fallback.
#[derive(Clone, Default)]
pub struct FetcherRegistry {
    overrides: Vec<(String, Arc<dyn CouncilFetcher>)>,
    generic: GenericCsvFetcher,
}

impl std::fmt::Debug for FetcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetcherRegistry")
            .field(
                "overrides",
                &self.overrides.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl FetcherRegistry {
    pub fn new(generic: GenericCsvFetcher) -> Self {
        Self {
            overrides: Vec::new(),
            generic,
        }
    }

    /// Register an override. A later registration for the same council wins.
    pub fn register(&mut self, fetcher: Arc<dyn CouncilFetcher>) {
        let key = council_key(fetcher.council());
        self.overrides.retain(|(k, _)| *k != key);
        self.overrides.push((key, fetcher));
    }

    pub fn with(mut self, fetcher: Arc<dyn CouncilFetcher>) -> Self {
        self.register(fetcher);
        self
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }

    pub fn overrides(&self) -> impl Iterator<Item = &Arc<dyn CouncilFetcher>> {
        self.overrides.iter().map(|(_, f)| f)
    }

    pub fn resolve(&self, council: &str) -> Option<Arc<dyn CouncilFetcher>> {
        let key = council_key(council);
        if key.is_empty() {
            return None;
        }
        if let Some((_, fetcher)) = self.overrides.iter().find(|(k, _)| *k == key) {
            return Some(fetcher.clone());
        }
        self.overrides
            .iter()
            .map(|(k, f)| (jaro_winkler(k, &key), f))
            .filter(|(score, _)| *score >= COUNCIL_MATCH_THRESHOLD)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, f)| f.clone())
    }

    pub fn has_override(&self, council: &str) -> bool {
        self.resolve(council).is_some()
    }

    /// Fetch raw records for one source. A registered override is solely
    /// responsible for its council; `url` is only used by the generic fetcher.
    pub async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        council: &str,
        url: &str,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        match self.resolve(council) {
            Some(fetcher) => {
                debug!(council, fetcher = fetcher.council(), "using council override");
                fetcher.fetch_records(http, ctx).await
            }
            None => self.generic.fetch(http, ctx, council, url).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spend_storage::StatusCode;

    fn ok_response(content_type: Option<&str>, body: &[u8]) -> FetchedResponse {
        FetchedResponse {
            status: StatusCode::OK,
            final_url: "https://example.gov.uk/spend.csv".into(),
            content_type: content_type.map(str::to_string),
            body: body.to_vec(),
        }
    }

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn supplier_name_header_maps_case_insensitively() {
        let mapping = ColumnAliases::default().resolve(&headers(&["date", "SUPPLIER NAME", "amount"]));
        assert_eq!(mapping.column_for(CanonicalField::Supplier), Some(1));
        assert_eq!(mapping.column_for(CanonicalField::PaymentDate), Some(0));
        assert_eq!(mapping.column_for(CanonicalField::AmountGbp), Some(2));
        assert_eq!(mapping.column_for(CanonicalField::InvoiceRef), None);
    }

    #[test]
    fn first_alias_wins_over_header_order() {
        // "Amount" is listed before "Net Amount", so it wins even though it
        // appears later in the file.
        let mapping = ColumnAliases::default().resolve(&headers(&["Net Amount", "Amount", "  Payment   Date "]));
        assert_eq!(mapping.column_for(CanonicalField::AmountGbp), Some(1));
        assert_eq!(mapping.column_for(CanonicalField::PaymentDate), Some(2));
    }

    #[test]
    fn prepended_aliases_take_precedence() {
        let aliases = ColumnAliases::default().prepend(CanonicalField::Category, ["ServiceArea"]);
        assert_eq!(aliases.aliases(CanonicalField::Category)[0], "ServiceArea");
        let mapping = aliases.resolve(&headers(&["Department", "ServiceArea"]));
        assert_eq!(mapping.column_for(CanonicalField::Category), Some(1));
        assert_eq!(
            aliases
                .aliases(CanonicalField::Category)
                .iter()
                .filter(|a| a.as_str() == "ServiceArea")
                .count(),
            1
        );
    }

    #[test]
    fn generic_mapping_produces_canonical_records() {
        let body = "Payment Date,Supplier Name,Purpose,Department,Amount,Invoice Ref\n\
                    01/03/2024,Acme Ltd,Road repairs,Highways,\"£1,234.50\",INV-1\n\
                    ,,,,,\n";
        let records = records_from_response(
            &ok_response(Some("text/csv"), body.as_bytes()),
            "Worthing",
            &ColumnAliases::default(),
        )
        .unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.get(CanonicalField::Council), Some(&RawValue::Text("Worthing".into())));
        assert_eq!(r.get(CanonicalField::Supplier), Some(&RawValue::Text("Acme Ltd".into())));
        assert_eq!(r.get(CanonicalField::AmountGbp), Some(&RawValue::Text("£1,234.50".into())));
        assert_eq!(r.get(CanonicalField::Description), Some(&RawValue::Text("Road repairs".into())));
    }

    #[test]
    fn semicolon_files_fall_back() {
        let table = parse_delimited("Date;Supplier;Amount\n2024-01-02;Acme;10,50\n").unwrap();
        assert_eq!(table.delimiter, b';');
        assert_eq!(table.headers, headers(&["Date", "Supplier", "Amount"]));
        assert_eq!(table.rows[0][2], "10,50");
    }

    #[test]
    fn decimal_commas_are_read_in_semicolon_tables_only() {
        assert_eq!(decimal_comma_amount("1200,00").as_deref(), Some("1200.00"));
        assert_eq!(decimal_comma_amount(" £1.234,5 ").as_deref(), Some("£1234.5"));
        assert_eq!(decimal_comma_amount("-75,10").as_deref(), Some("-75.10"));
        assert_eq!(decimal_comma_amount("1,234"), None);
        assert_eq!(decimal_comma_amount("1,234,56"), None);
        assert_eq!(decimal_comma_amount("300"), None);

        let semicolon = parse_delimited("Date;Supplier;Amount\n2024-01-02;Acme;10,50\n")
            .unwrap()
            .into_records("Blaby", &ColumnAliases::default());
        assert_eq!(semicolon[0].get(CanonicalField::AmountGbp), Some(&RawValue::Text("10.50".into())));

        let comma = parse_delimited("Date,Supplier,Amount\n2024-01-02,Acme,\"10,50\"\n")
            .unwrap()
            .into_records("Blaby", &ColumnAliases::default());
        assert_eq!(comma[0].get(CanonicalField::AmountGbp), Some(&RawValue::Text("10,50".into())));
    }

    #[test]
    fn ragged_rows_still_parse_leniently() {
        let table = parse_delimited("Date,Supplier,Amount\n2024-01-02,Acme,10\nTotal,,10,extra\n").unwrap();
        assert_eq!(table.delimiter, b',');
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn latin1_bytes_decode() {
        let mut body = b"Supplier,Amount\nCaf".to_vec();
        body.push(0xe9);
        body.extend_from_slice(b" Nero,\xa3100\n");
        let (text, encoding) = decode_text(&body);
        assert_eq!(encoding, TextEncoding::Latin1);
        assert!(text.contains("Café Nero"));
        assert!(text.contains("£100"));
    }

    #[test]
    fn utf8_bom_is_stripped_before_header_matching() {
        let body = "\u{feff}Supplier,Amount\nAcme,5\n";
        let records = records_from_response(
            &ok_response(None, body.as_bytes()),
            "Blaby",
            &ColumnAliases::default(),
        )
        .unwrap();
        assert_eq!(records[0].get(CanonicalField::Supplier), Some(&RawValue::Text("Acme".into())));
    }

    #[test]
    fn html_error_pages_are_hard_failures() {
        let page = b"\n  <!DOCTYPE html><html><body>Not found</body></html>";
        let err = records_from_response(&ok_response(Some("text/csv"), page), "York", &ColumnAliases::default())
            .unwrap_err();
        assert_eq!(err.kind(), "not_tabular");
        assert!(err.snippet().unwrap().contains("Not found"));

        let err = ensure_tabular(&ok_response(Some("text/html; charset=utf-8"), b"a,b\n1,2\n")).unwrap_err();
        assert!(matches!(err, AdapterError::NotTabular { .. }));
    }

    #[test]
    fn header_only_file_is_empty_not_error() {
        let records = records_from_response(
            &ok_response(Some("text/csv"), b"Date,Supplier,Amount\n"),
            "Durham",
            &ColumnAliases::default(),
        )
        .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn council_keys_drop_administrative_noise() {
        assert_eq!(council_key("Bristol City Council"), "bristol");
        assert_eq!(council_key("City of York Council"), "york");
        assert_eq!(council_key("Stockton-on-Tees Borough Council"), "stockton on tees");
        assert_eq!(council_key("Stockton-on-Tees"), "stockton on tees");
    }

    struct FixedFetcher {
        council: &'static str,
    }

    #[async_trait]
    impl CouncilFetcher for FixedFetcher {
        fn council(&self) -> &str {
            self.council
        }

        fn origin(&self) -> &str {
            "https://example.gov.uk/index"
        }

        async fn fetch_records(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
        ) -> Result<Vec<RawRecord>, AdapterError> {
            Ok(vec![RawRecord::new().with(CanonicalField::Council, self.council)])
        }
    }

    #[test]
    fn registry_resolves_publisher_names_to_overrides() {
        let registry = FetcherRegistry::default()
            .with(Arc::new(FixedFetcher { council: "Bristol" }))
            .with(Arc::new(FixedFetcher { council: "Newcastle" }));

        assert_eq!(registry.resolve("Bristol City Council").unwrap().council(), "Bristol");
        assert_eq!(registry.resolve("Newcastle City Council").unwrap().council(), "Newcastle");
        assert!(registry.resolve("Newcastle-under-Lyme Borough Council").is_none());
        assert!(registry.resolve("City Council").is_none());
        assert!(!registry.has_override("Leeds City Council"));
    }

    #[tokio::test]
    async fn override_takes_precedence_over_generic_fetch() {
        let registry = FetcherRegistry::default().with(Arc::new(FixedFetcher { council: "Durham" }));
        let http = HttpFetcher::new(Default::default()).unwrap();
        let ctx = AdapterContext::new(Uuid::new_v4());
        // The URL is never requested: the override owns the council.
        let records = registry
            .fetch(&http, &ctx, "Durham County Council", "http://127.0.0.1:9/unused.csv")
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }
}
