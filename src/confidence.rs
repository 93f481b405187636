//! Confidence scoring for a single engine's output.
//!
//! An engine's own confidence number is not trustworthy on its own: engines
//! are happily 95% sure of garbage. So we combine four signals:
//!
//! 1. **Field confidence**: how many of the expected invoice fields did we get,
//!    and do they pass format checks?
//! 2. **Spatial confidence**: does the page layout look like a document, read
//!    top to bottom?
//! 3. **Domain context**: do tax IDs, dates, amounts, tax rates, company names
//!    and addresses look like real ones?
//! 4. **Processing confidence**: what did the OCR engine think of its own
//!    blocks, and did it find a reasonable amount of text?
//!
//! Then we add small bonuses for strong domain signals, and clamp to `[0, 1]`.
//! All weights are configurable. The defaults are hand-tuned.

use std::collections::BTreeMap;

use schemars::JsonSchema;

use crate::{
    fields::{
        ExtractedField, ExtractedFields, FieldKind, FieldType, RawField, RawFields,
        TextBlock, ValidationStatus, value_present, value_text,
    },
    prelude::*,
    validators::{
        address_plausibility, document_number_plausible, has_legal_entity_suffix,
        is_currency_format, parse_amount, parse_date, tax_id_checksum_valid,
        tax_rate_plausible,
    },
};

/// Clamp a score to `[0, 1]`, mapping NaN to 0.
pub fn clamp_unit(score: f64) -> f64 {
    if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) }
}

/// Weights of the four top-level components.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComponentWeights {
    pub field: f64,
    pub spatial: f64,
    pub domain: f64,
    pub processing: f64,
}

impl Default for ComponentWeights {
    fn default() -> Self {
        Self {
            field: 0.40,
            spatial: 0.25,
            domain: 0.20,
            processing: 0.15,
        }
    }
}

/// Per-field weights for field confidence.
///
/// These don't need to sum to 1.0; we normalize by the total.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FieldWeights {
    pub document_number: f64,
    pub issue_date: f64,
    pub seller_tax_id: f64,
    pub buyer_tax_id: f64,
    pub gross_total: f64,
    pub net_total: f64,
    pub vat_total: f64,
    pub seller_name: f64,
    pub buyer_name: f64,
    pub line_items: f64,
}

impl Default for FieldWeights {
    fn default() -> Self {
        Self {
            document_number: 0.15,
            issue_date: 0.12,
            seller_tax_id: 0.14,
            buyer_tax_id: 0.14,
            gross_total: 0.13,
            net_total: 0.10,
            vat_total: 0.10,
            seller_name: 0.08,
            buyer_name: 0.08,
            line_items: 0.06,
        }
    }
}

impl FieldWeights {
    /// Weight of a field.
    pub fn weight(&self, kind: FieldKind) -> f64 {
        match kind {
            FieldKind::DocumentNumber => self.document_number,
            FieldKind::IssueDate => self.issue_date,
            FieldKind::SellerTaxId => self.seller_tax_id,
            FieldKind::BuyerTaxId => self.buyer_tax_id,
            FieldKind::GrossTotal => self.gross_total,
            FieldKind::NetTotal => self.net_total,
            FieldKind::VatTotal => self.vat_total,
            FieldKind::SellerName => self.seller_name,
            FieldKind::BuyerName => self.buyer_name,
            FieldKind::LineItems => self.line_items,
        }
    }
}

/// Weights of the spatial sub-signals.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpatialWeights {
    pub alignment: f64,
    pub spacing: f64,
    pub coverage: f64,
    pub structure: f64,
}

impl Default for SpatialWeights {
    fn default() -> Self {
        Self {
            alignment: 0.30,
            spacing: 0.25,
            coverage: 0.25,
            structure: 0.20,
        }
    }
}

/// Weights of the domain-context sub-signals.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DomainWeights {
    pub tax_id: f64,
    pub date: f64,
    pub currency: f64,
    pub tax_rate: f64,
    pub legal_entity: f64,
    pub address: f64,
}

impl Default for DomainWeights {
    fn default() -> Self {
        Self {
            tax_id: 0.25,
            date: 0.20,
            currency: 0.20,
            tax_rate: 0.15,
            legal_entity: 0.10,
            address: 0.10,
        }
    }
}

/// Additive domain boosts.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BoostConfig {
    /// Per valid tax ID.
    pub tax_id: f64,
    /// How many valid tax IDs can earn a boost.
    pub max_tax_ids: usize,
    pub date: f64,
    pub currency: f64,
    pub tax_rate: f64,
    pub legal_entity: f64,
    /// Cap on the sum of all boosts.
    pub total_cap: f64,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            tax_id: 0.15,
            max_tax_ids: 2,
            date: 0.10,
            currency: 0.08,
            tax_rate: 0.08,
            legal_entity: 0.05,
            total_cap: 0.30,
        }
    }
}

/// Lower bounds of the reporting buckets.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BucketThresholds {
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for BucketThresholds {
    fn default() -> Self {
        Self {
            high: 0.85,
            medium: 0.70,
            low: 0.50,
        }
    }
}

/// Everything tunable about confidence scoring.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfidenceConfig {
    pub components: ComponentWeights,
    pub fields: FieldWeights,
    pub spatial: SpatialWeights,
    pub domain: DomainWeights,
    pub boosts: BoostConfig,
    pub buckets: BucketThresholds,

    /// Weight of average block confidence in processing confidence. The rest
    /// goes to text density.
    pub block_confidence_weight: f64,

    /// Block count at which text density saturates.
    pub density_saturation: usize,

    /// VAT rates considered plausible, as fractions.
    pub plausible_tax_rates: Vec<f64>,

    /// How far `vat / net` may stray from a plausible rate.
    pub tax_rate_tolerance: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            components: ComponentWeights::default(),
            fields: FieldWeights::default(),
            spatial: SpatialWeights::default(),
            domain: DomainWeights::default(),
            boosts: BoostConfig::default(),
            buckets: BucketThresholds::default(),
            block_confidence_weight: 0.7,
            density_saturation: 50,
            plausible_tax_rates: vec![0.23, 0.08, 0.05, 0.0, 0.19, 0.20, 0.21, 0.07],
            tax_rate_tolerance: 0.005,
        }
    }
}

/// Categorical confidence label for reporting.
#[derive(Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBucket {
    High,
    Medium,
    Low,
    Critical,
}

impl ConfidenceBucket {
    /// Bucket a score.
    pub fn from_score(score: f64, thresholds: &BucketThresholds) -> Self {
        if score >= thresholds.high {
            ConfidenceBucket::High
        } else if score >= thresholds.medium {
            ConfidenceBucket::Medium
        } else if score >= thresholds.low {
            ConfidenceBucket::Low
        } else {
            ConfidenceBucket::Critical
        }
    }
}

/// Spatial sub-signals.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct SpatialSignals {
    pub alignment: f64,
    pub spacing: f64,
    pub coverage: f64,
    pub structure: f64,
}

/// Domain-context sub-signals.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct DomainSignals {
    pub tax_id: f64,
    pub date: f64,
    pub currency: f64,
    pub tax_rate: f64,
    pub legal_entity: f64,
    pub address: f64,
}

/// A full breakdown of how we arrived at a confidence score.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ConfidenceReport {
    pub overall: f64,
    pub bucket: ConfidenceBucket,
    pub field_confidence: f64,
    pub spatial_confidence: f64,
    pub domain_confidence: f64,
    pub processing_confidence: f64,
    pub domain_boost: f64,
    pub spatial: SpatialSignals,
    pub domain: DomainSignals,
    /// Confidence of each expected field, 0.0 when missing.
    pub field_scores: BTreeMap<FieldKind, f64>,
}

/// Fields and confidence for one engine's output.
#[derive(Clone, Debug)]
pub struct ScoredExtraction {
    pub fields: ExtractedFields,
    pub report: ConfidenceReport,
}

/// Computes [`ConfidenceReport`]s.
#[derive(Clone, Debug, Default)]
pub struct ConfidenceCalculator {
    config: ConfidenceConfig,
}

impl ConfidenceCalculator {
    /// Create a calculator with the given settings.
    pub fn new(config: ConfidenceConfig) -> Self {
        Self { config }
    }

    /// Our settings.
    pub fn config(&self) -> &ConfidenceConfig {
        &self.config
    }

    /// Score raw engine output.
    ///
    /// `page_size` is `(width, height)`. When missing we infer it from the
    /// extents of the text blocks.
    #[instrument(level = "trace", skip_all, fields(fields = raw_fields.len(), blocks = blocks.len()))]
    pub fn score(
        &self,
        raw_fields: &RawFields,
        blocks: &[TextBlock],
        page_size: Option<(f64, f64)>,
    ) -> ScoredExtraction {
        let fields = raw_fields
            .iter()
            .map(|(name, raw)| (name.clone(), annotate_field(name, raw)))
            .collect::<ExtractedFields>();

        let (field_confidence, field_scores) = self.field_confidence(&fields);
        let spatial = spatial_signals(blocks, page_size);
        let spatial_confidence = self.weighted_spatial(&spatial);
        let domain = self.domain_signals(&fields, blocks);
        let domain_confidence = self.weighted_domain(&domain);
        let processing_confidence = self.processing_confidence(blocks);
        let domain_boost = self.domain_boost(&fields);

        let c = &self.config.components;
        let overall = clamp_unit(
            c.field * field_confidence
                + c.spatial * spatial_confidence
                + c.domain * domain_confidence
                + c.processing * processing_confidence
                + domain_boost,
        );
        trace!(
            overall,
            field_confidence,
            spatial_confidence,
            domain_confidence,
            processing_confidence,
            domain_boost,
            "Scored extraction"
        );

        ScoredExtraction {
            fields,
            report: ConfidenceReport {
                overall,
                bucket: ConfidenceBucket::from_score(overall, &self.config.buckets),
                field_confidence,
                spatial_confidence,
                domain_confidence,
                processing_confidence,
                domain_boost,
                spatial,
                domain,
                field_scores,
            },
        }
    }

    /// Bucket a score using our thresholds.
    pub fn bucket(&self, score: f64) -> ConfidenceBucket {
        ConfidenceBucket::from_score(score, &self.config.buckets)
    }

    /// Weighted average of per-field confidence over the expected fields.
    fn field_confidence(&self, fields: &ExtractedFields) -> (f64, BTreeMap<FieldKind, f64>) {
        let mut scores = BTreeMap::new();
        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for kind in FieldKind::ALL {
            let weight = self.config.fields.weight(kind);
            let score = fields
                .get(kind.as_str())
                .filter(|field| value_present(&field.value))
                .map(|field| field.confidence)
                .unwrap_or(0.0);
            scores.insert(kind, score);
            weighted += weight * score;
            total_weight += weight;
        }
        let confidence = if total_weight > 0.0 {
            clamp_unit(weighted / total_weight)
        } else {
            0.0
        };
        (confidence, scores)
    }

    fn weighted_spatial(&self, signals: &SpatialSignals) -> f64 {
        let w = &self.config.spatial;
        clamp_unit(
            w.alignment * signals.alignment
                + w.spacing * signals.spacing
                + w.coverage * signals.coverage
                + w.structure * signals.structure,
        )
    }

    fn domain_signals(&self, fields: &ExtractedFields, blocks: &[TextBlock]) -> DomainSignals {
        let text_of = |kind: FieldKind| fields.get(kind.as_str()).and_then(|f| f.text());

        // Fraction of present values passing a check, 0.0 when none present.
        let fraction = |kinds: &[FieldKind], check: &dyn Fn(&str) -> bool| {
            let present = kinds.iter().filter_map(|k| text_of(*k)).collect::<Vec<_>>();
            if present.is_empty() {
                0.0
            } else {
                present.iter().filter(|t| check(t)).count() as f64 / present.len() as f64
            }
        };

        let tax_id = fraction(
            &[FieldKind::SellerTaxId, FieldKind::BuyerTaxId],
            &tax_id_checksum_valid,
        );
        let date = fraction(&[FieldKind::IssueDate], &|t| parse_date(t).is_some());
        let currency = fraction(
            &[FieldKind::GrossTotal, FieldKind::NetTotal, FieldKind::VatTotal],
            &|t| parse_amount(t).is_some(),
        );
        let tax_rate = if self.tax_rate_ok(fields) { 1.0 } else { 0.0 };
        let legal_entity = if [FieldKind::SellerName, FieldKind::BuyerName]
            .iter()
            .filter_map(|k| text_of(*k))
            .any(|name| has_legal_entity_suffix(&name))
        {
            1.0
        } else {
            0.0
        };

        // Addresses are rarely extracted as fields, so look at all the text.
        let mut address_text = blocks
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        for (name, field) in fields {
            if name.contains("address")
                && let Some(text) = field.text()
            {
                address_text.push('\n');
                address_text.push_str(&text);
            }
        }
        let address = address_plausibility(&address_text);

        DomainSignals {
            tax_id,
            date,
            currency,
            tax_rate,
            legal_entity,
            address,
        }
    }

    fn weighted_domain(&self, signals: &DomainSignals) -> f64 {
        let w = &self.config.domain;
        clamp_unit(
            w.tax_id * signals.tax_id
                + w.date * signals.date
                + w.currency * signals.currency
                + w.tax_rate * signals.tax_rate
                + w.legal_entity * signals.legal_entity
                + w.address * signals.address,
        )
    }

    fn tax_rate_ok(&self, fields: &ExtractedFields) -> bool {
        let amount = |kind: FieldKind| {
            fields
                .get(kind.as_str())
                .and_then(|f| f.text())
                .and_then(|t| parse_amount(&t))
        };
        match (amount(FieldKind::NetTotal), amount(FieldKind::VatTotal)) {
            (Some(net), Some(vat)) => tax_rate_plausible(
                net,
                vat,
                &self.config.plausible_tax_rates,
                self.config.tax_rate_tolerance,
            ),
            _ => false,
        }
    }

    /// Average block confidence blended with text density.
    fn processing_confidence(&self, blocks: &[TextBlock]) -> f64 {
        if blocks.is_empty() {
            return 0.0;
        }
        let average = blocks
            .iter()
            .map(|b| normalize_block_confidence(b.confidence))
            .sum::<f64>()
            / blocks.len() as f64;
        let saturation = self.config.density_saturation.max(1) as f64;
        let density = (blocks.len() as f64 / saturation).min(1.0);
        let w = self.config.block_confidence_weight;
        clamp_unit(w * average + (1.0 - w) * density)
    }

    /// Sum of domain boosts, capped.
    fn domain_boost(&self, fields: &ExtractedFields) -> f64 {
        let b = &self.config.boosts;
        let text_of = |kind: FieldKind| fields.get(kind.as_str()).and_then(|f| f.text());

        let valid_tax_ids = [FieldKind::SellerTaxId, FieldKind::BuyerTaxId]
            .iter()
            .filter_map(|k| text_of(*k))
            .filter(|t| tax_id_checksum_valid(t))
            .count()
            .min(b.max_tax_ids);
        let mut boost = b.tax_id * valid_tax_ids as f64;
        if text_of(FieldKind::IssueDate).is_some_and(|t| parse_date(&t).is_some()) {
            boost += b.date;
        }
        if [FieldKind::GrossTotal, FieldKind::NetTotal, FieldKind::VatTotal]
            .iter()
            .filter_map(|k| text_of(*k))
            .any(|t| is_currency_format(&t))
        {
            boost += b.currency;
        }
        if self.tax_rate_ok(fields) {
            boost += b.tax_rate;
        }
        if [FieldKind::SellerName, FieldKind::BuyerName]
            .iter()
            .filter_map(|k| text_of(*k))
            .any(|t| has_legal_entity_suffix(&t))
        {
            boost += b.legal_entity;
        }
        boost.min(b.total_cap).max(0.0)
    }
}

/// Some engines report 0-100 instead of 0-1.
fn normalize_block_confidence(confidence: f64) -> f64 {
    if confidence > 1.0 {
        clamp_unit(confidence / 100.0)
    } else {
        clamp_unit(confidence)
    }
}

/// Run the format checks for one field and work out its confidence.
fn annotate_field(name: &str, raw: &RawField) -> ExtractedField {
    let kind = name.parse::<FieldKind>().ok();
    let field_type = kind.map(FieldKind::field_type).unwrap_or(FieldType::Other);
    let present = value_present(&raw.value);
    let text = value_text(&raw.value);

    let (validation, bonus) = if !present {
        (ValidationStatus::Unknown, 0.0)
    } else {
        match field_type {
            FieldType::TaxId => check(text.as_deref().is_some_and(tax_id_checksum_valid), 0.4),
            FieldType::Date => check(
                text.as_deref().and_then(parse_date).is_some(),
                0.3,
            ),
            FieldType::Amount => match text.as_deref() {
                Some(t) if is_currency_format(t) => (ValidationStatus::Valid, 0.4),
                Some(t) if parse_amount(t).is_some() => (ValidationStatus::Valid, 0.3),
                _ => (ValidationStatus::Invalid, 0.0),
            },
            FieldType::Identifier => check(
                text.as_deref().is_some_and(document_number_plausible),
                0.2,
            ),
            FieldType::PartyName => {
                if text.as_deref().is_some_and(has_legal_entity_suffix) {
                    (ValidationStatus::Valid, 0.2)
                } else {
                    (ValidationStatus::Unknown, 0.0)
                }
            }
            FieldType::LineItems => match &raw.value {
                Value::Array(items) if !items.is_empty() => (ValidationStatus::Valid, 0.2),
                _ => (ValidationStatus::Invalid, 0.0),
            },
            FieldType::Other => (ValidationStatus::Unknown, 0.0),
        }
    };

    let heuristic = if present { clamp_unit(0.5 + bonus) } else { 0.0 };
    let confidence = match raw.confidence {
        Some(confidence) => normalize_block_confidence(confidence),
        None => heuristic,
    };

    ExtractedField {
        value: raw.value.clone(),
        confidence,
        bbox: raw.bbox.clone(),
        validation,
        domain_bonus: bonus,
        field_type,
    }
}

fn check(passed: bool, bonus: f64) -> (ValidationStatus, f64) {
    if passed {
        (ValidationStatus::Valid, bonus)
    } else {
        (ValidationStatus::Invalid, 0.0)
    }
}

/// Layout sub-signals from block centers.
fn spatial_signals(blocks: &[TextBlock], page_size: Option<(f64, f64)>) -> SpatialSignals {
    let boxes = blocks
        .iter()
        .filter_map(|b| b.bbox.as_ref())
        .collect::<Vec<_>>();
    if boxes.is_empty() {
        return SpatialSignals::default();
    }

    let (page_width, page_height) = page_size.unwrap_or_else(|| {
        boxes.iter().fold((0.0_f64, 0.0_f64), |(w, h), bbox| {
            let (_, _, max_x, max_y) = bbox.extents();
            (w.max(max_x), h.max(max_y))
        })
    });
    if page_width <= 0.0 || page_height <= 0.0 {
        return SpatialSignals::default();
    }

    let centers = boxes.iter().map(|b| b.center()).collect::<Vec<_>>();
    let n = centers.len() as f64;

    let alignment = centers
        .iter()
        .filter(|(x, _)| *x <= page_width / 3.0)
        .count() as f64
        / n;

    let ys = centers
        .iter()
        .map(|(_, y)| y / page_height)
        .collect::<Vec<_>>();
    let spacing = if ys.len() < 2 {
        0.5
    } else {
        1.0 / (1.0 + std_dev(&ys))
    };

    let (min_y, max_y) = boxes.iter().fold((f64::MAX, f64::MIN), |(lo, hi), bbox| {
        let (_, top, _, bottom) = bbox.extents();
        (lo.min(top), hi.max(bottom))
    });
    let coverage = clamp_unit((max_y - min_y) / page_height);

    let order = (0..ys.len()).map(|i| i as f64).collect::<Vec<_>>();
    let structure = match pearson(&order, &ys) {
        Some(correlation) => correlation.max(0.0),
        None => 0.5,
    };

    SpatialSignals {
        alignment: clamp_unit(alignment),
        spacing: clamp_unit(spacing),
        coverage,
        structure: clamp_unit(structure),
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

/// Pearson correlation, or `None` when undefined.
fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() < 2 || xs.len() != ys.len() {
        return None;
    }
    let (mx, my) = (mean(xs), mean(ys));
    let cov = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| (x - mx) * (y - my))
        .sum::<f64>();
    let vx = xs.iter().map(|x| (x - mx).powi(2)).sum::<f64>();
    let vy = ys.iter().map(|y| (y - my).powi(2)).sum::<f64>();
    if vx == 0.0 || vy == 0.0 {
        None
    } else {
        Some(cov / (vx.sqrt() * vy.sqrt()))
    }
}
