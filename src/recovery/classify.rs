//! Failure classification and recovery strategy selection.
//!
//! Both are pure functions, so that the recovery state machine can be tested
//! without running anything.

use std::fmt;

use schemars::JsonSchema;

use crate::{errors::ProcessingError, prelude::*};

/// Failure families, each with its own retry policy.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
pub enum FailureType {
    #[serde(rename = "engine_error")]
    Engine,
    #[serde(rename = "preprocessing_error")]
    Preprocessing,
    #[serde(rename = "extraction_error")]
    Extraction,
    #[serde(rename = "validation_error")]
    Validation,
    #[serde(rename = "timeout_error")]
    Timeout,
    #[serde(rename = "resource_error")]
    Resource,
    #[serde(rename = "network_error")]
    Network,
    #[serde(rename = "unknown_error")]
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureType::Engine => "engine_error",
            FailureType::Preprocessing => "preprocessing_error",
            FailureType::Extraction => "extraction_error",
            FailureType::Validation => "validation_error",
            FailureType::Timeout => "timeout_error",
            FailureType::Resource => "resource_error",
            FailureType::Network => "network_error",
            FailureType::Unknown => "unknown_error",
        })
    }
}

impl FailureType {
    pub const ALL: [FailureType; 8] = [
        FailureType::Engine,
        FailureType::Preprocessing,
        FailureType::Extraction,
        FailureType::Validation,
        FailureType::Timeout,
        FailureType::Resource,
        FailureType::Network,
        FailureType::Unknown,
    ];
}

/// Keywords for each failure type, checked in this order. First match wins.
const KEYWORDS: &[(FailureType, &[&str])] = &[
    (
        FailureType::Network,
        &[
            "network",
            "connection",
            "connect",
            "dns",
            "socket",
            "unreachable",
            "reset by peer",
            "broken pipe",
        ],
    ),
    (
        FailureType::Resource,
        &[
            "resource",
            "memory",
            "no space",
            "disk full",
            "quota",
            "too many open files",
            "permit",
        ],
    ),
    (FailureType::Engine, &["engine", "ocr", "model"]),
    (
        FailureType::Preprocessing,
        &["preprocess", "image", "deskew", "denoise"],
    ),
    (FailureType::Extraction, &["extract", "parse", "no fields"]),
    (FailureType::Validation, &["validat", "invalid", "checksum"]),
    (FailureType::Timeout, &["timeout", "timed out", "deadline"]),
];

/// Classify an error by keyword matching on its type label and message.
pub fn classify(error: &ProcessingError) -> FailureType {
    classify_text(&format!("{}: {}", error.label(), error))
}

/// Classify free text, such as a stored error message.
pub fn classify_text(text: &str) -> FailureType {
    let text = text.to_lowercase();
    KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| text.contains(kw)))
        .map(|(failure_type, _)| *failure_type)
        .unwrap_or(FailureType::Unknown)
}

/// Retry budget and delay for one failure type.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub delay_secs: f64,
}

impl RetryPolicy {
    const fn new(max_retries: usize, delay_secs: f64) -> Self {
        Self {
            max_retries,
            delay_secs,
        }
    }
}

/// The `[recovery.policies]` table.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicies {
    pub engine: RetryPolicy,
    pub preprocessing: RetryPolicy,
    pub extraction: RetryPolicy,
    pub validation: RetryPolicy,
    pub timeout: RetryPolicy,
    pub resource: RetryPolicy,
    pub network: RetryPolicy,
    pub unknown: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            engine: RetryPolicy::new(2, 30.0),
            preprocessing: RetryPolicy::new(3, 10.0),
            extraction: RetryPolicy::new(2, 20.0),
            validation: RetryPolicy::new(1, 5.0),
            timeout: RetryPolicy::new(1, 60.0),
            resource: RetryPolicy::new(2, 45.0),
            network: RetryPolicy::new(3, 15.0),
            unknown: RetryPolicy::new(1, 30.0),
        }
    }
}

impl RetryPolicies {
    pub fn policy(&self, failure_type: FailureType) -> &RetryPolicy {
        match failure_type {
            FailureType::Engine => &self.engine,
            FailureType::Preprocessing => &self.preprocessing,
            FailureType::Extraction => &self.extraction,
            FailureType::Validation => &self.validation,
            FailureType::Timeout => &self.timeout,
            FailureType::Resource => &self.resource,
            FailureType::Network => &self.network,
            FailureType::Unknown => &self.unknown,
        }
    }

    /// Every policy, with its failure type.
    pub fn iter(&self) -> impl Iterator<Item = (FailureType, &RetryPolicy)> {
        FailureType::ALL
            .into_iter()
            .map(move |failure_type| (failure_type, self.policy(failure_type)))
    }
}

/// What to do about a failure.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Run the same engines again after the policy delay.
    RetrySameEngine,
    /// Try the next healthy engine in priority order.
    SwitchEngine,
    /// Try the next preprocessing preset.
    RetryWithPreprocessing,
    /// Retry with the lightest preprocessing preset.
    RetryWithLighterPreprocessing,
    /// Accept whatever we have, if enough key fields are there.
    PartialSuccess,
    /// Hand the job to a human.
    ManualReview,
    /// Stop for good. Only operators choose this.
    Abort,
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecoveryStrategy::RetrySameEngine => "retry_same_engine",
            RecoveryStrategy::SwitchEngine => "switch_engine",
            RecoveryStrategy::RetryWithPreprocessing => "retry_with_preprocessing",
            RecoveryStrategy::RetryWithLighterPreprocessing => {
                "retry_with_lighter_preprocessing"
            }
            RecoveryStrategy::PartialSuccess => "partial_success",
            RecoveryStrategy::ManualReview => "manual_review",
            RecoveryStrategy::Abort => "abort",
        })
    }
}

/// Failure counts for a job, at the time of a new failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FailureCounters {
    /// Earlier failures of the same type.
    pub type_failures: usize,
    /// All failures, including the new one.
    pub total_failures: usize,
}

/// Choose a recovery strategy for a failure.
pub fn select_strategy(
    failure_type: FailureType,
    counters: FailureCounters,
    policies: &RetryPolicies,
    max_total_failures: usize,
) -> RecoveryStrategy {
    if counters.total_failures >= max_total_failures {
        return RecoveryStrategy::ManualReview;
    }

    let exhausted = counters.type_failures >= policies.policy(failure_type).max_retries;
    if exhausted {
        match failure_type {
            FailureType::Engine => RecoveryStrategy::SwitchEngine,
            FailureType::Preprocessing => RecoveryStrategy::RetryWithPreprocessing,
            _ => RecoveryStrategy::PartialSuccess,
        }
    } else {
        match failure_type {
            FailureType::Engine
            | FailureType::Network
            | FailureType::Resource
            | FailureType::Unknown => RecoveryStrategy::RetrySameEngine,
            FailureType::Preprocessing => RecoveryStrategy::RetryWithPreprocessing,
            FailureType::Extraction | FailureType::Validation => {
                RecoveryStrategy::PartialSuccess
            }
            FailureType::Timeout => RecoveryStrategy::RetryWithLighterPreprocessing,
        }
    }
}
