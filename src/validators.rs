//! Pure format checks for invoice fields.
//!
//! None of these try to be authoritative. They only need to be good enough to
//! tell "this looks like a real tax ID" from "the OCR engine hallucinated
//! digits", since their output feeds into confidence scoring.

use std::sync::LazyLock;

use chrono::{Datelike as _, NaiveDate};
use regex::Regex;

use crate::fields::{ExtractedFields, FieldKind};

/// Weights for the 10-digit tax ID checksum (NIP).
const TAX_ID_WEIGHTS: [u32; 9] = [6, 5, 7, 2, 3, 4, 5, 6, 7];

/// Date formats we recognize, tried in order.
const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y", "%d-%m-%Y", "%Y.%m.%d", "%Y/%m/%d",
    "%d %B %Y", "%d %b %Y", "%B %d, %Y", "%b %d, %Y",
];

/// Absolute tolerance when checking `net + vat == gross`.
const TOTALS_TOLERANCE: f64 = 0.02;

static CURRENCY_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(PLN|EUR|USD|GBP|CHF|zł|zl|€|\$|£)").expect("failed to compile regex")
});

static AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-?(?:\d{1,3}(?:[ .,']\d{3})+|\d+)(?:[.,]\d{1,2})?$")
        .expect("failed to compile regex")
});

static LEGAL_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(sp\.\s*z\s*o\.?\s*o\.?|\bs\.\s*a\.|\bsp\.\s*[jkp]\.|\bs\.c\.|\bgmbh\b|\bag\b|\bltd\.?|\bllc\b|\binc\.?|\bcorp\.?|\bplc\b|\bs\.r\.o\.|\bb\.v\.|\bsarl\b|\bs\.r\.l\.)",
    )
    .expect("failed to compile regex")
});

static POSTAL_CODE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{2}-\d{3}\b|\b\d{5}\b").expect("failed to compile regex")
});

static STREET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\bul\.|\bal\.|\bpl\.|\bos\.|\bstreet\b|\bst\.|\bstr\.|\broad\b|\brd\.|\bavenue\b|\bave\.)")
        .expect("failed to compile regex")
});

static DOCUMENT_NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9/\-_. ]{0,40}$").expect("failed to compile regex")
});

/// Validate a 10-digit tax ID with the weighted-sum-mod-11 checksum.
///
/// Separators and a two-letter country prefix are ignored.
pub fn tax_id_checksum_valid(raw: &str) -> bool {
    let trimmed = raw.trim();
    let without_prefix = match trimmed.get(..2) {
        Some(prefix) if prefix.chars().all(|c| c.is_ascii_alphabetic()) => &trimmed[2..],
        _ => trimmed,
    };
    if without_prefix
        .chars()
        .any(|c| !(c.is_ascii_digit() || c == '-' || c == ' '))
    {
        return false;
    }
    let digits = without_prefix
        .chars()
        .filter_map(|c| c.to_digit(10))
        .collect::<Vec<_>>();
    if digits.len() != 10 {
        return false;
    }
    let sum: u32 = TAX_ID_WEIGHTS
        .iter()
        .zip(&digits)
        .map(|(weight, digit)| weight * digit)
        .sum();
    let checksum = sum % 11;
    checksum != 10 && checksum == digits[9]
}

/// Parse a date in any recognized format.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
        .filter(|date| (1990..=2100).contains(&date.year()))
}

/// Parse a monetary amount, tolerating thousands separators, decimal commas
/// and currency markers.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let without_currency = CURRENCY_MARKER_RE.replace_all(raw, "");
    let cleaned = without_currency.replace('\u{a0}', " ");
    let cleaned = cleaned.trim();
    if !AMOUNT_RE.is_match(cleaned) {
        return None;
    }

    // The decimal separator is the last `.` or `,` followed by at most two
    // digits. Everything else is a thousands separator.
    let (int_part, frac_part) = match cleaned.rfind(|c| c == '.' || c == ',') {
        Some(idx) if cleaned.len() - idx - 1 <= 2 => (&cleaned[..idx], &cleaned[idx + 1..]),
        _ => (cleaned, ""),
    };
    let int_digits = int_part
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '-')
        .collect::<String>();
    let normalized = if frac_part.is_empty() {
        int_digits
    } else {
        format!("{int_digits}.{frac_part}")
    };
    normalized.parse::<f64>().ok()
}

/// Does this look like a currency amount as printed on an invoice, i.e. a
/// parseable amount with either a currency marker or two decimal places?
pub fn is_currency_format(raw: &str) -> bool {
    if parse_amount(raw).is_none() {
        return false;
    }
    let stripped = CURRENCY_MARKER_RE.replace_all(raw, "");
    let stripped = stripped.trim();
    let has_cents = stripped.len() >= 3 && {
        let tail = &stripped.as_bytes()[stripped.len() - 3..];
        (tail[0] == b'.' || tail[0] == b',')
            && tail[1].is_ascii_digit()
            && tail[2].is_ascii_digit()
    };
    has_cents || CURRENCY_MARKER_RE.is_match(raw)
}

/// Is `vat / net` close to one of the `rates`?
pub fn tax_rate_plausible(net: f64, vat: f64, rates: &[f64], tolerance: f64) -> bool {
    if net <= 0.0 || vat < 0.0 {
        return false;
    }
    let ratio = vat / net;
    rates.iter().any(|rate| (ratio - rate).abs() <= tolerance)
}

/// Does a company name carry a recognized legal-entity suffix?
pub fn has_legal_entity_suffix(name: &str) -> bool {
    LEGAL_SUFFIX_RE.is_match(name)
}

/// Rate how address-like some text is: 1.0 with both a postal code and a
/// street marker, 0.5 with one of them, 0.0 otherwise.
pub fn address_plausibility(text: &str) -> f64 {
    let postal = POSTAL_CODE_RE.is_match(text);
    let street = STREET_RE.is_match(text);
    match (postal, street) {
        (true, true) => 1.0,
        (true, false) | (false, true) => 0.5,
        (false, false) => 0.0,
    }
}

/// Does this look like an invoice number?
pub fn document_number_plausible(raw: &str) -> bool {
    let trimmed = raw.trim();
    DOCUMENT_NUMBER_RE.is_match(trimmed) && trimmed.chars().any(|c| c.is_ascii_digit())
}

/// Structural problems that should block automatic processing: missing
/// required fields and totals that don't add up.
pub fn structural_errors(fields: &ExtractedFields) -> Vec<String> {
    let mut errors = Vec::new();
    for required in [
        FieldKind::DocumentNumber,
        FieldKind::IssueDate,
        FieldKind::GrossTotal,
    ] {
        let present = fields
            .get(required.as_str())
            .and_then(|field| field.text())
            .is_some();
        if !present {
            errors.push(format!("missing required field {required}"));
        }
    }

    let amount = |kind: FieldKind| {
        fields
            .get(kind.as_str())
            .and_then(|field| field.text())
            .and_then(|text| parse_amount(&text))
    };
    if let (Some(net), Some(vat), Some(gross)) = (
        amount(FieldKind::NetTotal),
        amount(FieldKind::VatTotal),
        amount(FieldKind::GrossTotal),
    ) && (net + vat - gross).abs() > TOTALS_TOLERANCE
    {
        errors.push(format!(
            "inconsistent totals: net {net:.2} + vat {vat:.2} != gross {gross:.2}"
        ));
    }
    errors
}
