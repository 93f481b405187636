//! Turning an ensemble confidence into an action.

use std::fmt;

use clap::ValueEnum;
use schemars::JsonSchema;

use crate::{
    config::DecisionConfig,
    fields::{ExtractedFields, FieldKind, value_present},
    prelude::*,
    validators::structural_errors,
};

/// How cautious to be about acting automatically.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    PartialEq,
    Serialize,
    ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStrategy {
    Strict,
    #[default]
    Standard,
    /// Never rejects: anything below `minimum` goes to a human instead.
    Lenient,
}

impl DecisionStrategy {
    pub const ALL: [DecisionStrategy; 3] = [
        DecisionStrategy::Strict,
        DecisionStrategy::Standard,
        DecisionStrategy::Lenient,
    ];

    /// Built-in thresholds for this strategy.
    pub fn default_thresholds(self) -> Thresholds {
        let (auto_create, manual_review, minimum) = match self {
            DecisionStrategy::Strict => (0.95, 0.85, 0.65),
            DecisionStrategy::Standard => (0.90, 0.70, 0.50),
            DecisionStrategy::Lenient => (0.80, 0.60, 0.40),
        };
        Thresholds {
            auto_create,
            manual_review,
            minimum,
        }
    }
}

impl fmt::Display for DecisionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecisionStrategy::Strict => "strict",
            DecisionStrategy::Standard => "standard",
            DecisionStrategy::Lenient => "lenient",
        })
    }
}

/// Confidence cut-offs for one strategy.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Thresholds {
    /// At or above this, act automatically.
    pub auto_create: f64,
    /// At or above this, ask a human.
    pub manual_review: f64,
    /// At or above this, keep the result but flag it.
    pub minimum: f64,
}

impl Thresholds {
    /// Thresholds must be ordered and lie in `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        let in_range = [self.auto_create, self.manual_review, self.minimum]
            .iter()
            .all(|t| (0.0..=1.0).contains(t));
        if !in_range {
            return Err(anyhow!("thresholds must lie in [0, 1]"));
        }
        if !(self.minimum <= self.manual_review && self.manual_review <= self.auto_create) {
            return Err(anyhow!(
                "thresholds must satisfy minimum <= manual_review <= auto_create"
            ));
        }
        Ok(())
    }
}

/// What to do with an extraction.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Trustworthy enough to act on without a human.
    AutoAccept,
    /// A human needs to look at it.
    ManualReview,
    /// Kept, but not acted on automatically.
    AcceptFlagged,
    /// Too unreliable to keep.
    Reject,
    /// Incomplete but usable, with mandatory human follow-up.
    PartialSuccess,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::AutoAccept => "auto_accept",
            Action::ManualReview => "manual_review",
            Action::AcceptFlagged => "accept_flagged",
            Action::Reject => "reject",
            Action::PartialSuccess => "partial_success",
        })
    }
}

/// A field a reviewer should double-check.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ReviewHint {
    pub field: FieldKind,
    /// 0.0 when the field is missing.
    pub confidence: f64,
}

/// The outcome of [`DecisionEngine::decide`].
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Decision {
    pub action: Action,
    pub strategy: DecisionStrategy,
    pub thresholds: Thresholds,
    pub confidence: f64,

    /// Low-confidence fields, for manual review.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub review_hints: Vec<ReviewHint>,

    /// Structural problems found in the extracted fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,
}

/// Maps confidence to [`Action`]s under a strategy.
#[derive(Clone, Debug)]
pub struct DecisionEngine {
    strategy: DecisionStrategy,
    thresholds: Thresholds,
    hint_threshold: f64,
}

impl DecisionEngine {
    /// Create an engine for `strategy`, using thresholds from `config`.
    pub fn new(config: &DecisionConfig, strategy: DecisionStrategy) -> Self {
        let thresholds = config.thresholds(strategy);
        let hint_threshold = config.hint_threshold.unwrap_or(thresholds.manual_review);
        Self {
            strategy,
            thresholds,
            hint_threshold,
        }
    }

    pub fn strategy(&self) -> DecisionStrategy {
        self.strategy
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Pick an action for an extraction with the given ensemble confidence.
    #[instrument(level = "debug", skip_all, fields(strategy = %self.strategy, confidence = confidence))]
    pub fn decide(&self, confidence: f64, fields: &ExtractedFields) -> Decision {
        let t = &self.thresholds;
        let validation_errors = structural_errors(fields);

        let mut action = if confidence >= t.auto_create {
            Action::AutoAccept
        } else if confidence >= t.manual_review {
            Action::ManualReview
        } else if confidence >= t.minimum {
            Action::AcceptFlagged
        } else if self.strategy == DecisionStrategy::Lenient {
            Action::ManualReview
        } else {
            Action::Reject
        };

        if action == Action::AutoAccept && !validation_errors.is_empty() {
            warn!(
                errors = ?validation_errors,
                "Blocking auto-accept because of validation errors"
            );
            action = Action::ManualReview;
        }

        let review_hints = if action == Action::ManualReview {
            self.review_hints(fields)
        } else {
            vec![]
        };

        Decision {
            action,
            strategy: self.strategy,
            thresholds: t.clone(),
            confidence,
            review_hints,
            validation_errors,
        }
    }

    /// Expected fields which are missing or below the hint threshold.
    fn review_hints(&self, fields: &ExtractedFields) -> Vec<ReviewHint> {
        FieldKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let confidence = fields
                    .get(kind.as_str())
                    .filter(|field| value_present(&field.value))
                    .map(|field| field.confidence)
                    .unwrap_or(0.0);
                (confidence < self.hint_threshold).then_some(ReviewHint {
                    field: kind,
                    confidence,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::{ConfidenceCalculator, tests::clean_invoice_fields};

    fn engine(strategy: DecisionStrategy) -> DecisionEngine {
        DecisionEngine::new(&DecisionConfig::default(), strategy)
    }

    fn clean_fields() -> ExtractedFields {
        ConfidenceCalculator::default()
            .score(&clean_invoice_fields(), &[], None)
            .fields
    }

    #[test]
    fn standard_strategy_bands() {
        let engine = engine(DecisionStrategy::Standard);
        let fields = clean_fields();
        assert_eq!(engine.decide(0.95, &fields).action, Action::AutoAccept);
        assert_eq!(engine.decide(0.90, &fields).action, Action::AutoAccept);
        assert_eq!(engine.decide(0.72, &fields).action, Action::ManualReview);
        assert_eq!(engine.decide(0.70, &fields).action, Action::ManualReview);
        assert_eq!(engine.decide(0.55, &fields).action, Action::AcceptFlagged);
        assert_eq!(engine.decide(0.49, &fields).action, Action::Reject);
    }

    #[test]
    fn single_engine_at_072_needs_review() {
        let decision = engine(DecisionStrategy::Standard).decide(0.72, &ExtractedFields::new());
        assert_eq!(decision.action, Action::ManualReview);
        // Every expected field is missing, so all of them are hints.
        assert_eq!(decision.review_hints.len(), FieldKind::ALL.len());
    }

    #[test]
    fn lenient_never_rejects() {
        let engine = engine(DecisionStrategy::Lenient);
        let fields = clean_fields();
        assert_eq!(engine.decide(0.10, &fields).action, Action::ManualReview);
        assert_eq!(engine.decide(0.45, &fields).action, Action::AcceptFlagged);
        assert_eq!(engine.decide(0.85, &fields).action, Action::AutoAccept);
    }

    #[test]
    fn strict_strategy_uses_higher_thresholds() {
        let engine = engine(DecisionStrategy::Strict);
        let fields = clean_fields();
        assert_eq!(engine.decide(0.92, &fields).action, Action::ManualReview);
        assert_eq!(engine.decide(0.60, &fields).action, Action::Reject);
    }

    #[test]
    fn validation_errors_block_auto_accept() {
        let engine = engine(DecisionStrategy::Standard);
        let mut fields = clean_fields();
        fields.remove("gross_total");
        let decision = engine.decide(0.97, &fields);
        assert_eq!(decision.action, Action::ManualReview);
        assert_eq!(decision.validation_errors.len(), 1);
        assert!(
            decision
                .review_hints
                .iter()
                .any(|hint| hint.field == FieldKind::GrossTotal && hint.confidence == 0.0)
        );

        // Below auto_create, validation errors are reported but don't change
        // the action.
        let decision = engine.decide(0.55, &fields);
        assert_eq!(decision.action, Action::AcceptFlagged);
        assert!(!decision.validation_errors.is_empty());
    }

    #[test]
    fn overridden_thresholds_apply() {
        let config = DecisionConfig {
            standard: Some(Thresholds {
                auto_create: 0.85,
                manual_review: 0.6,
                minimum: 0.4,
            }),
            ..DecisionConfig::default()
        };
        let engine = DecisionEngine::new(&config, DecisionStrategy::Standard);
        assert_eq!(engine.decide(0.87875, &clean_fields()).action, Action::AutoAccept);
        assert!(DecisionStrategy::Standard.default_thresholds().validate().is_ok());
    }
}
