//! Invoice fields, text blocks and their geometry.
//!
//! Engines hand us loosely-typed field values keyed by name. We only score the
//! fields in [`FieldKind`], but we keep anything else an engine reports so it
//! can be passed through to reviewers.

use std::{collections::BTreeMap, fmt, str::FromStr};

use schemars::JsonSchema;

use crate::prelude::*;

/// The invoice fields we know how to score.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    DocumentNumber,
    IssueDate,
    SellerTaxId,
    BuyerTaxId,
    GrossTotal,
    NetTotal,
    VatTotal,
    SellerName,
    BuyerName,
    LineItems,
}

impl FieldKind {
    /// Every field we score, in table order.
    pub const ALL: [FieldKind; 10] = [
        FieldKind::DocumentNumber,
        FieldKind::IssueDate,
        FieldKind::SellerTaxId,
        FieldKind::BuyerTaxId,
        FieldKind::GrossTotal,
        FieldKind::NetTotal,
        FieldKind::VatTotal,
        FieldKind::SellerName,
        FieldKind::BuyerName,
        FieldKind::LineItems,
    ];

    /// The name engines use for this field.
    pub fn as_str(self) -> &'static str {
        match self {
            FieldKind::DocumentNumber => "document_number",
            FieldKind::IssueDate => "issue_date",
            FieldKind::SellerTaxId => "seller_tax_id",
            FieldKind::BuyerTaxId => "buyer_tax_id",
            FieldKind::GrossTotal => "gross_total",
            FieldKind::NetTotal => "net_total",
            FieldKind::VatTotal => "vat_total",
            FieldKind::SellerName => "seller_name",
            FieldKind::BuyerName => "buyer_name",
            FieldKind::LineItems => "line_items",
        }
    }

    /// What sort of value does this field hold?
    pub fn field_type(self) -> FieldType {
        match self {
            FieldKind::DocumentNumber => FieldType::Identifier,
            FieldKind::IssueDate => FieldType::Date,
            FieldKind::SellerTaxId | FieldKind::BuyerTaxId => FieldType::TaxId,
            FieldKind::GrossTotal | FieldKind::NetTotal | FieldKind::VatTotal => {
                FieldType::Amount
            }
            FieldKind::SellerName | FieldKind::BuyerName => FieldType::PartyName,
            FieldKind::LineItems => FieldType::LineItems,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        FieldKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| anyhow!("unknown invoice field: {:?}", s))
    }
}

/// Coarse value type of a field, used to pick format checks.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Identifier,
    Date,
    TaxId,
    Amount,
    PartyName,
    LineItems,
    Other,
}

/// Result of running a field's format checks.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    #[default]
    Unknown,
    Valid,
    Invalid,
}

/// A bounding box, either as an axis-aligned rectangle or a 4-point polygon.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BoundingBox {
    Rect {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    },
    Polygon([[f64; 2]; 4]),
}

impl BoundingBox {
    /// `(min_x, min_y, max_x, max_y)`.
    pub fn extents(&self) -> (f64, f64, f64, f64) {
        match self {
            BoundingBox::Rect {
                x,
                y,
                width,
                height,
            } => (*x, *y, x + width, y + height),
            BoundingBox::Polygon(points) => points.iter().fold(
                (f64::MAX, f64::MAX, f64::MIN, f64::MIN),
                |(min_x, min_y, max_x, max_y), [px, py]| {
                    (min_x.min(*px), min_y.min(*py), max_x.max(*px), max_y.max(*py))
                },
            ),
        }
    }

    /// Center point.
    pub fn center(&self) -> (f64, f64) {
        let (min_x, min_y, max_x, max_y) = self.extents();
        ((min_x + max_x) / 2.0, (min_y + max_y) / 2.0)
    }
}

/// One recognized block of text.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct TextBlock {
    /// The recognized text.
    pub text: String,

    /// Per-block confidence. Some engines report 0-100; we normalize on use.
    #[serde(default)]
    pub confidence: f64,

    /// Where the block is on the page, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

/// A field as reported by an engine, before we score it.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct RawField {
    /// The extracted value. Usually a string; line items are an array.
    pub value: Value,

    /// Engine-supplied confidence, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    /// Where the value was found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,
}

/// A scored field.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ExtractedField {
    pub value: Value,

    /// Field confidence, from the engine or our heuristics.
    pub confidence: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BoundingBox>,

    pub validation: ValidationStatus,

    /// Bonus earned by passing domain-specific checks.
    pub domain_bonus: f64,

    pub field_type: FieldType,
}

impl ExtractedField {
    /// The value as text, if it is a non-empty string or number.
    pub fn text(&self) -> Option<String> {
        value_text(&self.value)
    }
}

/// Raw fields keyed by engine field name.
pub type RawFields = BTreeMap<String, RawField>;

/// Scored fields keyed by engine field name.
pub type ExtractedFields = BTreeMap<String, ExtractedField>;

/// Render a scalar value as trimmed text. Empty strings count as absent.
pub fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Is a raw value "present" for scoring purposes?
pub fn value_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}
