//! Running several OCR engines on one document and voting on the results.
//!
//! Each engine call runs as its own task with its own deadline. A slow engine
//! only costs us its deadline: when it passes, we record a timeout, abort the
//! task and carry on with whatever the other engines said.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{StreamExt as _, stream};
use schemars::JsonSchema;
use serde_json::Map;

use crate::{
    confidence::{ConfidenceCalculator, ConfidenceReport, clamp_unit},
    config::{Config, EnsembleConfig, ScoringMode},
    engines::{OcrEngine, engine_for_config},
    errors::ProcessingError,
    fields::{ExtractedFields, TextBlock},
    monitor::EngineMonitor,
    prelude::*,
    preprocess::PreprocessPreset,
};

use self::cache::{CacheKey, ResultCache};

pub mod cache;
pub mod voting;

/// The `error` recorded for an engine which missed its deadline.
pub const TIMEOUT_ERROR: &str = "timeout";

/// The `error` recorded for an engine we didn't call.
pub const UNAVAILABLE_ERROR: &str = "unavailable";

/// A document to process.
#[derive(Clone, Debug)]
pub struct Document {
    pub id: String,
    pub content: Arc<[u8]>,
    pub mime_type: String,
}

/// Per-call options for [`EnsembleController::process`].
#[derive(Clone, Debug, Default)]
pub struct ProcessOptions {
    /// Only run these engines.
    pub engines: Option<Vec<String>>,

    /// The preset `content` was preprocessed with, if any.
    pub preset: Option<PreprocessPreset>,
}

/// What one engine produced for one document.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct EngineResult {
    pub engine: String,

    /// This engine's voting weight.
    pub weight: f64,

    /// 0.0 for failures.
    pub confidence: f64,

    pub duration_ms: u64,

    #[serde(default)]
    pub fields: ExtractedFields,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocks: Vec<TextBlock>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// How we scored this result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<ConfidenceReport>,
}

impl EngineResult {
    /// A failed result.
    pub fn failed(engine: &str, weight: f64, duration: Duration, error: String) -> Self {
        Self {
            engine: engine.to_owned(),
            weight,
            confidence: 0.0,
            duration_ms: duration_ms(duration),
            fields: ExtractedFields::new(),
            blocks: vec![],
            metadata: Map::new(),
            error: Some(error),
            report: None,
        }
    }

    /// Did this engine produce something usable?
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.confidence > 0.0
    }

    pub fn is_timeout(&self) -> bool {
        self.error.as_deref() == Some(TIMEOUT_ERROR)
    }

    pub fn weighted_score(&self) -> f64 {
        self.confidence * self.weight
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// One engine's entry in [`VotingMetadata`].
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct EngineVote {
    pub confidence: f64,
    pub weight: f64,
    pub weighted_score: f64,
    pub duration_ms: u64,
    pub success: bool,
}

/// How the vote went.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct VotingMetadata {
    pub votes: BTreeMap<String, EngineVote>,

    /// Successful engines needed for the agreement boost.
    pub agreement_threshold: usize,

    pub agreement_boost_applied: bool,
}

/// The outcome of one ensemble run.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct EnsembleResult {
    /// Index of the chosen result. When nothing succeeded, this is the first
    /// result, as a nominal best.
    pub best_index: Option<usize>,

    /// Every engine we considered, in priority order, including failures.
    pub results: Vec<EngineResult>,

    pub confidence: f64,

    pub voting: VotingMetadata,

    /// Engines which succeeded.
    pub engines_used: BTreeSet<String>,

    /// Did we pick something other than the top-priority engine?
    pub fallback_used: bool,

    /// Did every engine fail?
    pub failed: bool,

    /// Was this served from the cache?
    #[serde(default)]
    pub from_cache: bool,
}

impl EnsembleResult {
    /// The chosen result.
    pub fn best(&self) -> Option<&EngineResult> {
        self.best_index.and_then(|idx| self.results.get(idx))
    }

    /// Why this run failed, if it did.
    pub fn failure(&self) -> Option<ProcessingError> {
        if !self.failed {
            return None;
        }
        if self.results.is_empty() {
            return Some(ProcessingError::Engine(
                "no engines were available to process the document".to_owned(),
            ));
        }
        let called = self
            .results
            .iter()
            .filter(|r| r.error.as_deref() != Some(UNAVAILABLE_ERROR))
            .collect::<Vec<_>>();
        if !called.is_empty() && called.iter().all(|r| r.is_timeout()) {
            return Some(ProcessingError::Timeout(format!(
                "no answer before the deadline from {} call(s)",
                called.len()
            )));
        }
        let errors = self
            .results
            .iter()
            .map(|r| {
                format!(
                    "{}: {}",
                    r.engine,
                    r.error.as_deref().unwrap_or("no usable output")
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        Some(ProcessingError::Engine(format!("every engine failed ({errors})")))
    }
}

/// An engine plus how much we trust it.
#[derive(Clone)]
pub struct RegisteredEngine {
    pub engine: Arc<dyn OcrEngine>,
    pub weight: f64,
    pub timeout: Duration,
}

/// Fans documents out to engines and votes on the results.
pub struct EnsembleController {
    /// In priority order.
    engines: Vec<RegisteredEngine>,
    max_workers: usize,
    agreement_boost: f64,
    agreement_min_engines: usize,
    scoring: ScoringMode,
    calculator: Arc<ConfidenceCalculator>,
    monitor: Arc<EngineMonitor>,
    cache: Option<ResultCache>,
}

impl EnsembleController {
    pub fn new(
        engines: Vec<RegisteredEngine>,
        config: &EnsembleConfig,
        calculator: ConfidenceCalculator,
        monitor: Arc<EngineMonitor>,
    ) -> Self {
        Self {
            engines,
            max_workers: config.max_workers.max(1),
            agreement_boost: config.agreement_boost,
            agreement_min_engines: config.agreement_min_engines,
            scoring: config.scoring,
            calculator: Arc::new(calculator),
            monitor,
            cache: config.cache.enabled.then(|| ResultCache::new(&config.cache)),
        }
    }

    /// Build a controller for the enabled engines in `config`.
    pub fn from_config(config: &Config, monitor: Arc<EngineMonitor>) -> Result<Self> {
        let engines = config
            .enabled_engines()
            .enumerate()
            .map(|(position, engine_config)| {
                let engine = engine_for_config(engine_config).with_context(|| {
                    format!("cannot create engine {:?}", engine_config.name)
                })?;
                Ok(RegisteredEngine {
                    engine,
                    weight: config.ensemble.weight_for(position, engine_config.weight),
                    timeout: engine_config.timeout(&config.ensemble),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(
            engines,
            &config.ensemble,
            ConfidenceCalculator::new(config.confidence.clone()),
            monitor,
        ))
    }

    /// Engine names, in priority order.
    pub fn engine_names(&self) -> Vec<String> {
        self.engines
            .iter()
            .map(|e| e.engine.name().to_owned())
            .collect()
    }

    /// Can we call this engine right now?
    pub fn is_engine_available(&self, name: &str) -> bool {
        self.engines
            .iter()
            .find(|e| e.engine.name() == name)
            .is_some_and(|e| e.engine.is_available() && self.monitor.is_healthy(name))
    }

    /// The next available engine after `current` in cyclic priority order.
    /// With no current engine, we start after the top-priority one.
    pub fn next_engine_after(&self, current: Option<&str>) -> Option<String> {
        let count = self.engines.len();
        let start = current
            .and_then(|name| self.engines.iter().position(|e| e.engine.name() == name))
            .unwrap_or(0);
        (1..count)
            .map(|offset| self.engines[(start + offset) % count].engine.name())
            .find(|name| self.is_engine_available(name))
            .map(str::to_owned)
    }

    /// Run the ensemble on a document.
    #[instrument(level = "debug", skip_all, fields(document = %document.id, preset = ?options.preset))]
    pub async fn process(&self, document: &Document, options: &ProcessOptions) -> EnsembleResult {
        let cache_key = self.cache.as_ref().map(|_| {
            CacheKey::new(
                &document.content,
                &document.mime_type,
                options.engines.as_deref(),
                options.preset,
            )
        });
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key)
            && let Some(hit) = cache.get(key)
        {
            debug!("Using cached ensemble result");
            return EnsembleResult {
                from_cache: true,
                ..hit
            };
        }

        // Partition the engines we were asked for into callable and not.
        let mut results = vec![];
        let mut to_run = vec![];
        for (position, registered) in self.engines.iter().enumerate() {
            let name = registered.engine.name();
            let wanted = options
                .engines
                .as_ref()
                .is_none_or(|names| names.iter().any(|n| n == name));
            if !wanted {
                continue;
            }
            if self.is_engine_available(name) {
                to_run.push((position, registered.clone()));
            } else {
                debug!(engine = name, "Skipping unavailable engine");
                results.push((
                    position,
                    EngineResult::failed(
                        name,
                        registered.weight,
                        Duration::ZERO,
                        UNAVAILABLE_ERROR.to_owned(),
                    ),
                ));
            }
        }

        // Fan out, collecting in completion order.
        let pool_size = self.max_workers.min(to_run.len()).max(1);
        let content = document.content.clone();
        let mime_type: Arc<str> = Arc::from(document.mime_type.as_str());
        let completed = stream::iter(to_run.into_iter().map(|(position, registered)| {
            let call = run_engine(
                registered,
                content.clone(),
                mime_type.clone(),
                self.calculator.clone(),
                self.scoring,
            );
            async move { (position, call.await) }
        }))
        .buffer_unordered(pool_size)
        .collect::<Vec<_>>()
        .await;
        for (_, result) in &completed {
            match &result.error {
                None => self.monitor.record_success(&result.engine),
                Some(error) => self.monitor.record_failure(&result.engine, error),
            }
        }
        results.extend(completed);

        // Vote in priority order.
        results.sort_by_key(|(position, _)| *position);
        let results = results.into_iter().map(|(_, r)| r).collect::<Vec<_>>();
        let ensemble = self.vote(results);

        info!(
            confidence = ensemble.confidence,
            best = ensemble.best().map(|r| r.engine.as_str()).unwrap_or("none"),
            succeeded = ensemble.engines_used.len(),
            attempted = ensemble.results.len(),
            fallback_used = ensemble.fallback_used,
            "Ensemble finished"
        );
        if let (Some(cache), Some(key)) = (&self.cache, cache_key)
            && !ensemble.failed
        {
            cache.insert(key, ensemble.clone());
        }
        ensemble
    }

    /// Select and merge. `results` must be in priority order.
    fn vote(&self, results: Vec<EngineResult>) -> EnsembleResult {
        let best = voting::select_best(&results);
        let (confidence, agreement_boost_applied) = voting::ensemble_confidence(
            &results,
            self.agreement_boost,
            self.agreement_min_engines,
        );
        let failed = best.is_none();
        let best_index = best.or_else(|| (!results.is_empty()).then_some(0));

        let top_engine = self.engines.first().map(|e| e.engine.name());
        let fallback_used = best_index
            .and_then(|idx| results.get(idx))
            .is_some_and(|r| Some(r.engine.as_str()) != top_engine);

        let votes = results
            .iter()
            .map(|r| {
                (
                    r.engine.clone(),
                    EngineVote {
                        confidence: r.confidence,
                        weight: r.weight,
                        weighted_score: r.weighted_score(),
                        duration_ms: r.duration_ms,
                        success: r.is_success(),
                    },
                )
            })
            .collect();
        let engines_used = results
            .iter()
            .filter(|r| r.is_success())
            .map(|r| r.engine.clone())
            .collect();

        EnsembleResult {
            best_index,
            results,
            confidence,
            voting: VotingMetadata {
                votes,
                agreement_threshold: self.agreement_min_engines,
                agreement_boost_applied,
            },
            engines_used,
            fallback_used,
            failed,
            from_cache: false,
        }
    }
}

/// Call one engine under its deadline and score the output.
#[instrument(level = "debug", skip_all, fields(engine = %registered.engine.name()))]
async fn run_engine(
    registered: RegisteredEngine,
    content: Arc<[u8]>,
    mime_type: Arc<str>,
    calculator: Arc<ConfidenceCalculator>,
    scoring: ScoringMode,
) -> EngineResult {
    let RegisteredEngine {
        engine,
        weight,
        timeout,
    } = registered;
    let name = engine.name().to_owned();
    let started = Instant::now();

    let task_engine = engine.clone();
    let mut handle =
        tokio::spawn(async move { task_engine.process(&content, &mime_type).await });
    let outcome = tokio::time::timeout(timeout, &mut handle).await;
    let elapsed = started.elapsed();

    let output = match outcome {
        Err(_) => {
            // Best effort: this drops the engine's future at its next await.
            handle.abort();
            warn!(engine = %name, ?timeout, "Engine timed out; abandoning it");
            return EngineResult::failed(&name, weight, elapsed, TIMEOUT_ERROR.to_owned());
        }
        Ok(Err(join_err)) => {
            warn!(engine = %name, %join_err, "Engine task crashed");
            return EngineResult::failed(
                &name,
                weight,
                elapsed,
                format!("engine task failed: {join_err}"),
            );
        }
        Ok(Ok(Err(err))) => {
            warn!(engine = %name, %err, "Engine failed");
            return EngineResult::failed(&name, weight, elapsed, err.to_string());
        }
        Ok(Ok(Ok(output))) => output,
    };

    let scored = calculator.score(&output.fields, &output.blocks, output.page_size());
    let confidence = match (scoring, output.confidence) {
        (ScoringMode::EngineReported, Some(reported)) => normalize_reported(reported),
        _ => scored.report.overall,
    };
    debug!(
        engine = %name,
        confidence,
        calculated = scored.report.overall,
        duration_ms = duration_ms(elapsed),
        "Engine finished"
    );
    EngineResult {
        engine: name,
        weight,
        confidence,
        duration_ms: duration_ms(elapsed),
        fields: scored.fields,
        blocks: output.blocks,
        metadata: output.metadata,
        error: None,
        report: Some(scored.report),
    }
}

/// Engines report confidence either as a fraction or as a percentage.
fn normalize_reported(confidence: f64) -> f64 {
    if confidence > 1.0 {
        clamp_unit(confidence / 100.0)
    } else {
        clamp_unit(confidence)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::MonitorConfig,
        decision::{Action, DecisionEngine, DecisionStrategy},
        engines::testing::{Script, ScriptedEngine, output_with_confidence},
        config::DecisionConfig,
    };

    /// A successful result.
    pub(crate) fn result(engine: &str, confidence: f64, weight: f64) -> EngineResult {
        EngineResult {
            confidence,
            error: None,
            ..EngineResult::failed(engine, weight, Duration::ZERO, String::new())
        }
    }

    /// A failed result.
    pub(crate) fn failed_result(engine: &str, weight: f64, error: &str) -> EngineResult {
        EngineResult::failed(engine, weight, Duration::ZERO, error.to_owned())
    }

    /// A one-engine ensemble with the given confidence.
    pub(crate) fn ensemble_of(confidence: f64) -> EnsembleResult {
        EnsembleResult {
            best_index: Some(0),
            results: vec![result("primary", confidence, 0.5)],
            confidence,
            voting: VotingMetadata::default(),
            engines_used: BTreeSet::from(["primary".to_owned()]),
            fallback_used: false,
            failed: false,
            from_cache: false,
        }
    }

    pub(crate) fn document() -> Document {
        Document {
            id: "doc-1".to_owned(),
            content: Arc::from(&b"%PDF-1.7 fake"[..]),
            mime_type: "application/pdf".to_owned(),
        }
    }

    /// A controller trusting engine-reported confidence, without a cache.
    pub(crate) fn controller(
        engines: &[(Arc<ScriptedEngine>, f64)],
        timeout: Duration,
    ) -> EnsembleController {
        controller_with(engines, timeout, EnsembleConfig {
            scoring: ScoringMode::EngineReported,
            cache: crate::config::CacheConfig {
                enabled: false,
                ..Default::default()
            },
            ..EnsembleConfig::default()
        })
    }

    pub(crate) fn controller_with(
        engines: &[(Arc<ScriptedEngine>, f64)],
        timeout: Duration,
        config: EnsembleConfig,
    ) -> EnsembleController {
        let registered = engines
            .iter()
            .map(|(engine, weight)| RegisteredEngine {
                engine: engine.clone(),
                weight: *weight,
                timeout,
            })
            .collect();
        EnsembleController::new(
            registered,
            &config,
            ConfidenceCalculator::default(),
            Arc::new(EngineMonitor::new(&MonitorConfig::default())),
        )
    }

    fn scripted(name: &str, script: Script) -> Arc<ScriptedEngine> {
        Arc::new(ScriptedEngine::new(name, vec![script]))
    }

    #[tokio::test]
    async fn two_successes_and_a_timeout() {
        let engines = [
            (scripted("primary", Script::Succeed(output_with_confidence(0.92))), 0.5),
            (scripted("secondary", Script::Succeed(output_with_confidence(0.81))), 0.3),
            (scripted("tertiary", Script::Hang), 0.2),
        ];
        let controller = controller(&engines, Duration::from_millis(100));
        let started = Instant::now();
        let ensemble = controller.process(&document(), &ProcessOptions::default()).await;
        assert!(started.elapsed() < Duration::from_secs(5));

        let tertiary = &ensemble.results[2];
        assert_eq!(tertiary.engine, "tertiary");
        assert_eq!(tertiary.error.as_deref(), Some("timeout"));
        assert_eq!(tertiary.confidence, 0.0);

        assert_eq!(ensemble.best().unwrap().engine, "primary");
        assert!((ensemble.voting.votes["primary"].weighted_score - 0.46).abs() < 1e-9);
        assert!((ensemble.voting.votes["secondary"].weighted_score - 0.243).abs() < 1e-9);
        assert!((ensemble.confidence - 0.87875).abs() < 1e-9);
        assert!(!ensemble.voting.agreement_boost_applied);
        assert!(!ensemble.fallback_used);
        assert!(!ensemble.failed);
        assert_eq!(
            ensemble.engines_used,
            BTreeSet::from(["primary".to_owned(), "secondary".to_owned()])
        );

        // 0.87875 sits between the standard strategy's manual_review and
        // auto_create thresholds, and above the lenient auto_create.
        let fields = ExtractedFields::new();
        let standard = DecisionEngine::new(&DecisionConfig::default(), DecisionStrategy::Standard);
        assert_eq!(
            standard.decide(ensemble.confidence, &fields).action,
            Action::ManualReview
        );
    }

    #[tokio::test]
    async fn single_success_is_used_directly() {
        let engines = [
            (scripted("primary", Script::Fail("model crashed".into())), 0.5),
            (scripted("secondary", Script::Succeed(output_with_confidence(0.72))), 0.3),
        ];
        let controller = controller(&engines, Duration::from_secs(5));
        let ensemble = controller.process(&document(), &ProcessOptions::default()).await;
        assert_eq!(ensemble.confidence, 0.72);
        assert_eq!(ensemble.best().unwrap().engine, "secondary");
        assert!(ensemble.fallback_used);
        assert_eq!(
            ensemble.results[0].error.as_deref(),
            Some("engine failed: model crashed")
        );
    }

    #[tokio::test]
    async fn nothing_succeeds() {
        let engines = [
            (scripted("primary", Script::Fail("boom".into())), 0.5),
            (scripted("secondary", Script::Hang), 0.3),
        ];
        let controller = controller(&engines, Duration::from_millis(50));
        let ensemble = controller.process(&document(), &ProcessOptions::default()).await;
        assert!(ensemble.failed);
        assert_eq!(ensemble.confidence, 0.0);
        // Nominal best is the first result.
        assert_eq!(ensemble.best().unwrap().engine, "primary");
        assert!(matches!(ensemble.failure(), Some(ProcessingError::Engine(_))));
    }

    #[tokio::test]
    async fn all_timeouts_are_a_timeout_failure() {
        let engines = [
            (scripted("primary", Script::Hang), 0.5),
            (scripted("secondary", Script::Hang), 0.3),
        ];
        let controller = controller(&engines, Duration::from_millis(50));
        let ensemble = controller.process(&document(), &ProcessOptions::default()).await;
        assert!(matches!(ensemble.failure(), Some(ProcessingError::Timeout(_))));
    }

    #[tokio::test]
    async fn restriction_and_availability() {
        let primary = scripted("primary", Script::Succeed(output_with_confidence(0.9)));
        let secondary = Arc::new(
            ScriptedEngine::new("secondary", vec![Script::Succeed(output_with_confidence(0.8))])
                .unavailable(),
        );
        let tertiary = scripted("tertiary", Script::Succeed(output_with_confidence(0.7)));
        let engines = [(primary.clone(), 0.5), (secondary.clone(), 0.3), (tertiary.clone(), 0.2)];
        let controller = controller(&engines, Duration::from_secs(5));

        let ensemble = controller.process(&document(), &ProcessOptions::default()).await;
        assert_eq!(secondary.calls(), 0);
        assert_eq!(ensemble.results[1].error.as_deref(), Some(UNAVAILABLE_ERROR));
        assert_eq!(ensemble.results.len(), 3);

        let options = ProcessOptions {
            engines: Some(vec!["tertiary".to_owned()]),
            preset: None,
        };
        let ensemble = controller.process(&document(), &options).await;
        assert_eq!(ensemble.results.len(), 1);
        assert_eq!(ensemble.best().unwrap().engine, "tertiary");
        assert!(ensemble.fallback_used);
        assert_eq!(primary.calls(), 1);

        // Cyclic engine switching skips unavailable engines.
        assert_eq!(controller.next_engine_after(Some("primary")).as_deref(), Some("tertiary"));
        assert_eq!(controller.next_engine_after(Some("tertiary")).as_deref(), Some("primary"));
        assert_eq!(controller.next_engine_after(None).as_deref(), Some("tertiary"));
    }

    #[tokio::test]
    async fn unhealthy_engines_are_skipped() {
        let primary = scripted("primary", Script::Fail("model crashed".into()));
        let secondary = scripted("secondary", Script::Succeed(output_with_confidence(0.8)));
        let controller = controller(
            &[(primary.clone(), 0.5), (secondary.clone(), 0.3)],
            Duration::from_secs(5),
        );
        for _ in 0..3 {
            controller.process(&document(), &ProcessOptions::default()).await;
        }
        assert_eq!(primary.calls(), 3);
        assert!(!controller.is_engine_available("primary"));
        let ensemble = controller.process(&document(), &ProcessOptions::default()).await;
        assert_eq!(primary.calls(), 3);
        assert_eq!(ensemble.results[0].error.as_deref(), Some(UNAVAILABLE_ERROR));
        assert_eq!(controller.next_engine_after(Some("secondary")), None);
    }

    #[tokio::test]
    async fn successful_results_are_cached() {
        let primary = scripted("primary", Script::Succeed(output_with_confidence(0.9)));
        let controller = controller_with(
            &[(primary.clone(), 0.5)],
            Duration::from_secs(5),
            EnsembleConfig {
                scoring: ScoringMode::EngineReported,
                ..EnsembleConfig::default()
            },
        );
        let first = controller.process(&document(), &ProcessOptions::default()).await;
        let second = controller.process(&document(), &ProcessOptions::default()).await;
        assert!(!first.from_cache);
        assert!(second.from_cache);
        assert_eq!(second.confidence, first.confidence);
        assert_eq!(primary.calls(), 1);

        // A different preset is a different run.
        let options = ProcessOptions {
            engines: None,
            preset: Some(PreprocessPreset::Minimal),
        };
        controller.process(&document(), &options).await;
        assert_eq!(primary.calls(), 2);
    }

    #[tokio::test]
    async fn calculated_scoring_ignores_engine_claims() {
        let primary = scripted("primary", Script::Succeed(output_with_confidence(0.99)));
        let controller = controller_with(
            &[(primary, 0.5)],
            Duration::from_secs(5),
            EnsembleConfig::default(),
        );
        let ensemble = controller.process(&document(), &ProcessOptions::default()).await;
        // Nothing extracted and no blocks, so our own score is zero.
        assert!(ensemble.failed);
        assert!(ensemble.results[0].report.is_some());
    }

    #[test]
    fn reported_percentages_are_normalized() {
        assert_eq!(normalize_reported(87.0), 0.87);
        assert_eq!(normalize_reported(0.5), 0.5);
        assert_eq!(normalize_reported(250.0), 1.0);
        assert_eq!(normalize_reported(-1.0), 0.0);
    }
}
