//! Field-level cleaning of raw council rows.
//!
//! Nothing here fails. A field that cannot be parsed falls back to a safe
//! default and the fallback is reported through [`Cleaned`], so "defaulted"
//! stays distinguishable from "genuinely zero".

use std::borrow::Cow;

use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{CanonicalField, CleanedPayment, FieldDefault, RawRecord, RawValue};

/// Upper bound on stored description length, in characters.
pub const DESCRIPTION_MAX_CHARS: usize = 2000;

/// Date formats tried in order after ISO. UK day-first wins over month-first
/// because every upstream publisher is a UK authority.
const DATE_FORMATS: [&str; 5] = ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d", "%d-%m-%Y", "%d %b %Y"];

/// Spreadsheet serial day numbers accepted as dates (roughly 1995..2064).
const SERIAL_DAY_RANGE: (f64, f64) = (35_000.0, 60_000.0);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "input", rename_all = "snake_case")]
pub enum DefaultReason {
    Missing,
    Empty,
    Unparseable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cleaned<T> {
    Parsed(T),
    Defaulted { value: T, reason: DefaultReason },
}

impl<T> Cleaned<T> {
    pub fn value(&self) -> &T {
        match self {
            Cleaned::Parsed(v) => v,
            Cleaned::Defaulted { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Cleaned::Parsed(v) => v,
            Cleaned::Defaulted { value, .. } => value,
        }
    }

    pub fn default_reason(&self) -> Option<&DefaultReason> {
        match self {
            Cleaned::Parsed(_) => None,
            Cleaned::Defaulted { reason, .. } => Some(reason),
        }
    }

    pub fn is_defaulted(&self) -> bool {
        matches!(self, Cleaned::Defaulted { .. })
    }
}

fn value_text(value: &RawValue) -> Option<Cow<'_, str>> {
    match value {
        RawValue::Text(s) => Some(Cow::Borrowed(s.as_str())),
        RawValue::Number(n) => Some(Cow::Owned(render_number(*n))),
        RawValue::Date(d) => Some(Cow::Owned(d.format("%Y-%m-%d").to_string())),
        RawValue::DateTime(dt) => Some(Cow::Owned(dt.format("%Y-%m-%d %H:%M:%S").to_string())),
        RawValue::Blank => None,
    }
}

fn render_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn missing_or_empty<T>(value: Option<&RawValue>, default: T) -> Cleaned<T> {
    let reason = if value.is_none() {
        DefaultReason::Missing
    } else {
        DefaultReason::Empty
    };
    Cleaned::Defaulted {
        value: default,
        reason,
    }
}

/// Trim free text. Integral numbers render without a fractional part.
pub fn clean_text(value: Option<&RawValue>) -> Cleaned<String> {
    let Some(text) = value.and_then(value_text) else {
        return missing_or_empty(value, String::new());
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return missing_or_empty(value, String::new());
    }
    Cleaned::Parsed(trimmed.to_string())
}

pub fn clean_supplier(value: Option<&RawValue>) -> Cleaned<String> {
    match clean_text(value) {
        Cleaned::Parsed(s) => Cleaned::Parsed(collapse_whitespace(&s)),
        other => other,
    }
}

pub fn clean_description(value: Option<&RawValue>) -> Cleaned<String> {
    match clean_text(value) {
        Cleaned::Parsed(s) => {
            let collapsed = collapse_whitespace(&s);
            if collapsed.chars().count() > DESCRIPTION_MAX_CHARS {
                Cleaned::Parsed(collapsed.chars().take(DESCRIPTION_MAX_CHARS).collect())
            } else {
                Cleaned::Parsed(collapsed)
            }
        }
        other => other,
    }
}

/// Parse an amount in pounds. Empty and unparseable inputs default to `0.0`.
pub fn clean_amount(value: Option<&RawValue>) -> Cleaned<f64> {
    let text = match value {
        Some(RawValue::Number(n)) if n.is_finite() => return Cleaned::Parsed(*n),
        Some(RawValue::Number(n)) => {
            return Cleaned::Defaulted {
                value: 0.0,
                reason: DefaultReason::Unparseable(n.to_string()),
            }
        }
        Some(RawValue::Text(s)) => s.as_str(),
        Some(RawValue::Date(_)) | Some(RawValue::DateTime(_)) => {
            return Cleaned::Defaulted {
                value: 0.0,
                reason: DefaultReason::Unparseable(
                    value.and_then(value_text).unwrap_or_default().into_owned(),
                ),
            }
        }
        Some(RawValue::Blank) | None => return missing_or_empty(value, 0.0),
    };

    let stripped: String = text
        .chars()
        .filter(|c| *c != '£' && *c != ',' && !c.is_whitespace())
        .collect();
    if stripped.is_empty() {
        return missing_or_empty(value, 0.0);
    }
    match stripped.parse::<f64>() {
        Ok(n) if n.is_finite() => Cleaned::Parsed(n),
        _ => Cleaned::Defaulted {
            value: 0.0,
            reason: DefaultReason::Unparseable(text.trim().to_string()),
        },
    }
}

fn serial_day(n: f64) -> Option<NaiveDate> {
    if n > SERIAL_DAY_RANGE.0 && n < SERIAL_DAY_RANGE.1 {
        let base = NaiveDate::from_ymd_opt(1899, 12, 30)?;
        base.checked_add_signed(Duration::days(n.trunc() as i64))
    } else {
        None
    }
}

fn parse_date_str(input: &str) -> Option<NaiveDate> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(n) = s.parse::<f64>() {
        if let Some(d) = serial_day(n) {
            return Some(d);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }
    let bytes = s.as_bytes();
    if bytes.len() == 7
        && bytes[4] == b'-'
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[5..].iter().all(u8::is_ascii_digit)
    {
        if let Ok(d) = NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d") {
            return Some(d);
        }
    }
    if bytes.len() == 4 && bytes.iter().all(u8::is_ascii_digit) {
        let year: i32 = s.parse().ok()?;
        return NaiveDate::from_ymd_opt(year, 1, 1);
    }
    None
}

/// Parse a payment date; `None` when no known format matches.
pub fn clean_date(value: Option<&RawValue>) -> Option<NaiveDate> {
    match value? {
        RawValue::Date(d) => Some(*d),
        RawValue::DateTime(dt) => Some(dt.date()),
        RawValue::Number(n) => serial_day(*n).or_else(|| parse_date_str(&render_number(*n))),
        RawValue::Blank => None,
        RawValue::Text(s) => parse_date_str(s).or_else(|| {
            // "01/03/2024 00:00:00" and "2024-03-01T09:30:00" carry a time part.
            let head = s.trim().split([' ', 'T']).next()?;
            if head.len() < s.trim().len() {
                parse_date_str(head)
            } else {
                None
            }
        }),
    }
}

fn take<T>(field: CanonicalField, cleaned: Cleaned<T>, defaults: &mut Vec<FieldDefault>) -> T {
    match cleaned {
        Cleaned::Parsed(v) => v,
        Cleaned::Defaulted { value, reason } => {
            defaults.push(FieldDefault { field, reason });
            value
        }
    }
}

/// Clean every canonical field of a raw record.
pub fn normalize_record(record: &RawRecord) -> CleanedPayment {
    let mut defaults = Vec::new();

    let council = take(
        CanonicalField::Council,
        clean_text(record.get(CanonicalField::Council)),
        &mut defaults,
    );
    let raw_date = record.get(CanonicalField::PaymentDate);
    let payment_date = clean_date(raw_date);
    if payment_date.is_none() {
        let reason = match raw_date.and_then(value_text) {
            Some(text) if !text.trim().is_empty() => DefaultReason::Unparseable(text.trim().to_string()),
            _ if raw_date.is_none() => DefaultReason::Missing,
            _ => DefaultReason::Empty,
        };
        defaults.push(FieldDefault {
            field: CanonicalField::PaymentDate,
            reason,
        });
    }
    let supplier = take(
        CanonicalField::Supplier,
        clean_supplier(record.get(CanonicalField::Supplier)),
        &mut defaults,
    );
    let description = take(
        CanonicalField::Description,
        clean_description(record.get(CanonicalField::Description)),
        &mut defaults,
    );
    let category = take(
        CanonicalField::Category,
        clean_text(record.get(CanonicalField::Category)),
        &mut defaults,
    );
    let amount_gbp = take(
        CanonicalField::AmountGbp,
        clean_amount(record.get(CanonicalField::AmountGbp)),
        &mut defaults,
    );
    let invoice_ref = take(
        CanonicalField::InvoiceRef,
        clean_text(record.get(CanonicalField::InvoiceRef)),
        &mut defaults,
    );

    CleanedPayment {
        council,
        payment_date,
        supplier,
        description,
        category,
        amount_gbp,
        invoice_ref,
        defaults,
    }
}
