//! Pipeline configuration, loaded from a TOML (or JSON) file.
//!
//! ```toml
//! [ensemble]
//! max_workers = 4
//! engine_timeout_secs = 30
//!
//! [[engines]]
//! name = "tesseract"
//! kind = "command"
//! program = "tesseract-invoice"
//! args = ["--json", "{input}"]
//! rate_limit = "10/s"
//!
//! [[engines]]
//! name = "paddle"
//! kind = "command"
//! program = "paddle-invoice"
//! weight = 0.3
//!
//! [decision]
//! strategy = "standard"
//! ```
//!
//! Engines are listed in priority order. Everything else has a default.

use std::{collections::HashSet, time::Duration};

use crate::{
    async_utils::io::read_json_or_toml,
    confidence::ConfidenceConfig,
    decision::{DecisionStrategy, Thresholds},
    engines::throttle::EngineRateLimit,
    prelude::*,
    preprocess::PreprocessPreset,
    recovery::classify::RetryPolicies,
};

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub ensemble: EnsembleConfig,

    /// OCR engines, highest priority first.
    pub engines: Vec<EngineConfig>,

    #[serde(default)]
    pub preprocessing: PreprocessingConfig,

    #[serde(default)]
    pub confidence: ConfidenceConfig,

    #[serde(default)]
    pub decision: DecisionConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load and validate a config file.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Result<Self> {
        let config = read_json_or_toml::<Config>(path).await?;
        config
            .validate()
            .with_context(|| format!("invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    /// Check for settings which would parse but can't work.
    pub fn validate(&self) -> Result<()> {
        if self.enabled_engines().next().is_none() {
            return Err(anyhow!("at least one enabled engine is required"));
        }
        let mut seen = HashSet::new();
        for engine in &self.engines {
            if engine.name.trim().is_empty() {
                return Err(anyhow!("engine names must not be empty"));
            }
            if !seen.insert(engine.name.as_str()) {
                return Err(anyhow!("engine {:?} is listed twice", engine.name));
            }
            if let Some(weight) = engine.weight
                && !(weight > 0.0 && weight <= 1.0)
            {
                return Err(anyhow!(
                    "engine {:?} has weight {weight}, which must be in (0, 1]",
                    engine.name
                ));
            }
            if let Some(timeout) = engine.timeout_secs {
                check_timeout(&format!("engine {:?} timeout_secs", engine.name), timeout)?;
            }
        }
        if self.ensemble.max_workers == 0 {
            return Err(anyhow!("ensemble.max_workers must be >= 1"));
        }
        check_timeout(
            "ensemble.engine_timeout_secs",
            self.ensemble.engine_timeout_secs,
        )?;
        check_secs("preprocessing.timeout_secs", self.preprocessing.timeout_secs)?;
        if self.ensemble.agreement_boost < 1.0 {
            return Err(anyhow!("ensemble.agreement_boost must be >= 1.0"));
        }
        let scale = self.recovery.delay_scale;
        if !(scale.is_finite() && scale >= 0.0) {
            return Err(anyhow!("recovery.delay_scale must be finite and >= 0"));
        }
        for (failure_type, policy) in self.recovery.policies.iter() {
            let what = format!("{failure_type} retry delay");
            check_secs(&what, policy.delay_secs)?;
            check_secs(&format!("scaled {what}"), policy.delay_secs * scale)?;
        }
        for strategy in DecisionStrategy::ALL {
            self.decision.thresholds(strategy).validate().with_context(|| {
                format!("bad thresholds for the {strategy} strategy")
            })?;
        }
        Ok(())
    }

    /// Enabled engines, in priority order.
    pub fn enabled_engines(&self) -> impl Iterator<Item = &EngineConfig> {
        self.engines.iter().filter(|engine| engine.enabled)
    }
}

/// Seconds which [`Duration::from_secs_f64`] can convert without panicking.
fn check_secs(what: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .with_context(|| format!("{what} is {secs}, which is not a usable number of seconds"))
}

fn check_timeout(what: &str, secs: f64) -> Result<()> {
    if check_secs(what, secs)?.is_zero() {
        return Err(anyhow!("{what} must be > 0"));
    }
    Ok(())
}

/// How we compute the confidence of a single engine's result.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMode {
    /// Use our own multi-signal score.
    #[default]
    Calculated,

    /// Trust the engine's own confidence when it reports one.
    EngineReported,
}

/// `[ensemble]` settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnsembleConfig {
    /// Upper bound on engines running at once for one document.
    pub max_workers: usize,

    /// Default per-engine deadline.
    pub engine_timeout_secs: f64,

    /// Multiplier applied when enough engines succeed.
    pub agreement_boost: f64,

    /// How many successful engines earn the agreement boost.
    pub agreement_min_engines: usize,

    /// Weights for engines without an explicit weight, by priority position.
    pub default_weights: Vec<f64>,

    /// Weight for engines past the end of `default_weights`.
    pub fallback_weight: f64,

    pub scoring: ScoringMode,

    pub cache: CacheConfig,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            engine_timeout_secs: 30.0,
            agreement_boost: 1.1,
            agreement_min_engines: 3,
            default_weights: vec![0.5, 0.3, 0.2],
            fallback_weight: 0.1,
            scoring: ScoringMode::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl EnsembleConfig {
    /// The weight of an engine at `position` in the priority list.
    pub fn weight_for(&self, position: usize, explicit: Option<f64>) -> f64 {
        explicit.unwrap_or_else(|| {
            self.default_weights
                .get(position)
                .copied()
                .unwrap_or(self.fallback_weight)
        })
    }
}

/// `[ensemble.cache]` settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 256,
            ttl_secs: 3600,
        }
    }
}

/// An `[[engines]]` entry.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EngineConfig {
    pub name: String,

    #[serde(flatten)]
    pub kind: EngineKind,

    /// Voting weight. Defaults by priority position.
    #[serde(default)]
    pub weight: Option<f64>,

    /// Overrides `ensemble.engine_timeout_secs`.
    #[serde(default)]
    pub timeout_secs: Option<f64>,

    #[serde(default)]
    pub rate_limit: Option<EngineRateLimit>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl EngineConfig {
    /// This engine's deadline.
    pub fn timeout(&self, ensemble: &EnsembleConfig) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.unwrap_or(ensemble.engine_timeout_secs))
    }
}

fn default_true() -> bool {
    true
}

/// The kind of engine, with kind-specific settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineKind {
    /// An external program printing engine JSON.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },

    /// Replays recorded output.
    Replay,
}

/// `[preprocessing]` settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreprocessingConfig {
    /// External image preprocessor. Without one, documents pass through
    /// unchanged.
    pub program: Option<String>,

    /// Arguments; `{input}`, `{output}` and `{ops}` are substituted.
    pub args: Vec<String>,

    /// Preset for the first attempt. Without one, the first attempt sees the
    /// original bytes.
    pub initial_preset: Option<PreprocessPreset>,

    pub timeout_secs: f64,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            program: None,
            args: vec![],
            initial_preset: None,
            timeout_secs: 60.0,
        }
    }
}

/// `[decision]` settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecisionConfig {
    pub strategy: DecisionStrategy,

    /// Per-strategy threshold overrides.
    pub strict: Option<Thresholds>,
    pub standard: Option<Thresholds>,
    pub lenient: Option<Thresholds>,

    /// Fields scoring below this are listed as review hints. Defaults to the
    /// strategy's `manual_review` threshold.
    pub hint_threshold: Option<f64>,
}

impl DecisionConfig {
    /// Thresholds for a strategy, with overrides applied.
    pub fn thresholds(&self, strategy: DecisionStrategy) -> Thresholds {
        let overridden = match strategy {
            DecisionStrategy::Strict => self.strict.as_ref(),
            DecisionStrategy::Standard => self.standard.as_ref(),
            DecisionStrategy::Lenient => self.lenient.as_ref(),
        };
        overridden.cloned().unwrap_or_else(|| strategy.default_thresholds())
    }
}

/// `[recovery]` settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryConfig {
    /// Retry budget and delay per failure type.
    pub policies: RetryPolicies,

    /// Total failures after which a job always goes to manual review.
    pub max_total_failures: usize,

    /// Multiplier for retry delays. `0` retries immediately.
    pub delay_scale: f64,

    /// Minimum ensemble confidence for accepting a partial result.
    pub partial_success_min_confidence: f64,

    /// How many of the key fields a partial result needs.
    pub partial_success_min_fields: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            policies: RetryPolicies::default(),
            max_total_failures: 5,
            delay_scale: 1.0,
            partial_success_min_confidence: 0.30,
            partial_success_min_fields: 2,
        }
    }
}

impl RecoveryConfig {
    /// Scale a policy delay.
    pub fn scaled_delay(&self, delay_secs: f64) -> Duration {
        Duration::from_secs_f64((delay_secs * self.delay_scale).max(0.0))
    }
}

/// `[monitor]` settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Consecutive failures after which an engine is benched.
    pub failure_threshold: usize,

    /// How long a benched engine sits out, and the minimum gap between
    /// alerts for one engine.
    pub cooldown_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
[ensemble]
max_workers = 2
scoring = "engine_reported"

[ensemble.cache]
capacity = 8

[[engines]]
name = "primary"
kind = "replay"

[[engines]]
name = "secondary"
kind = "command"
program = "ocr-wrapper"
args = ["--json"]
weight = 0.4
timeout_secs = 5
rate_limit = "2/s"

[[engines]]
name = "spare"
kind = "replay"
enabled = false

[decision]
strategy = "lenient"

[decision.strict]
auto_create = 0.97
manual_review = 0.9
minimum = 0.7

[recovery]
delay_scale = 0.0

[recovery.policies.timeout]
max_retries = 2
delay_secs = 1
"#;

    #[test]
    fn parses_full_config() {
        let config = toml::from_str::<Config>(CONFIG).unwrap();
        config.validate().unwrap();

        assert_eq!(config.ensemble.max_workers, 2);
        assert_eq!(config.ensemble.scoring, ScoringMode::EngineReported);
        assert_eq!(config.ensemble.cache.capacity, 8);
        assert_eq!(config.ensemble.cache.ttl_secs, 3600);
        assert_eq!(config.ensemble.agreement_boost, 1.1);

        let names = config
            .enabled_engines()
            .map(|e| e.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, ["primary", "secondary"]);
        let secondary = &config.engines[1];
        assert!(matches!(
            &secondary.kind,
            EngineKind::Command { program, args } if program == "ocr-wrapper" && args == &["--json"]
        ));
        assert_eq!(secondary.timeout(&config.ensemble), Duration::from_secs(5));
        assert_eq!(
            secondary.rate_limit,
            Some("2/s".parse::<EngineRateLimit>().unwrap())
        );
        assert_eq!(
            config.engines[0].timeout(&config.ensemble),
            Duration::from_secs(30)
        );

        assert_eq!(config.decision.strategy, DecisionStrategy::Lenient);
        assert_eq!(config.decision.thresholds(DecisionStrategy::Strict).auto_create, 0.97);
        assert_eq!(
            config.decision.thresholds(DecisionStrategy::Standard),
            DecisionStrategy::Standard.default_thresholds()
        );

        assert_eq!(config.recovery.delay_scale, 0.0);
        assert_eq!(config.recovery.max_total_failures, 5);
        assert_eq!(config.recovery.policies.timeout.max_retries, 2);
        assert_eq!(config.recovery.policies.engine.max_retries, 2);
        assert_eq!(config.recovery.policies.engine.delay_secs, 30.0);
        assert_eq!(config.monitor.failure_threshold, 3);
    }

    #[test]
    fn default_weights_by_position() {
        let ensemble = EnsembleConfig::default();
        assert_eq!(ensemble.weight_for(0, None), 0.5);
        assert_eq!(ensemble.weight_for(1, None), 0.3);
        assert_eq!(ensemble.weight_for(2, None), 0.2);
        assert_eq!(ensemble.weight_for(3, None), 0.1);
        assert_eq!(ensemble.weight_for(7, None), 0.1);
        assert_eq!(ensemble.weight_for(0, Some(0.9)), 0.9);
    }

    #[test]
    fn rejects_broken_configs() {
        let no_engines = toml::from_str::<Config>("engines = []").unwrap();
        assert!(no_engines.validate().is_err());

        let duplicate = toml::from_str::<Config>(
            r#"
[[engines]]
name = "a"
kind = "replay"
[[engines]]
name = "a"
kind = "replay"
"#,
        )
        .unwrap();
        assert!(duplicate.validate().is_err());

        let bad_weight = toml::from_str::<Config>(
            r#"
[[engines]]
name = "a"
kind = "replay"
weight = 1.5
"#,
        )
        .unwrap();
        assert!(bad_weight.validate().is_err());

        let bad_thresholds = toml::from_str::<Config>(
            r#"
[[engines]]
name = "a"
kind = "replay"
[decision.standard]
auto_create = 0.5
manual_review = 0.7
minimum = 0.2
"#,
        )
        .unwrap();
        assert!(bad_thresholds.validate().is_err());

        assert!(toml::from_str::<Config>("typo = 1\nengines = []").is_err());
    }

    #[test]
    fn rejects_durations_that_cannot_be_slept() {
        let engine = "[[engines]]\nname = \"a\"\nkind = \"replay\"\n";
        for broken in [
            "[ensemble]\nengine_timeout_secs = inf\n",
            "[ensemble]\nengine_timeout_secs = 1e300\n",
            "[preprocessing]\ntimeout_secs = nan\n",
            "[recovery]\ndelay_scale = inf\n",
            "[recovery.policies.resource]\nmax_retries = 2\ndelay_secs = inf\n",
            "[recovery]\ndelay_scale = 1e10\n[recovery.policies.network]\nmax_retries = 3\ndelay_secs = 1e10\n",
        ] {
            let config = toml::from_str::<Config>(&format!("{broken}{engine}")).unwrap();
            assert!(config.validate().is_err(), "accepted {broken:?}");
        }

        let timeout = toml::from_str::<Config>(&format!("{engine}timeout_secs = inf\n")).unwrap();
        let err = timeout.validate().unwrap_err();
        assert!(format!("{err:#}").contains("not a usable number of seconds"));

        let fine = toml::from_str::<Config>(&format!(
            "[recovery.policies.resource]\nmax_retries = 2\ndelay_secs = 0.5\n{engine}"
        ))
        .unwrap();
        fine.validate().unwrap();
    }
}
