//! The fallback and retry manager.
//!
//! [`FallbackManager::process_document`] drives one job to a resting state:
//! preprocess, run the ensemble, decide. When an attempt fails, the failure
//! is classified, a recovery strategy is chosen, and the job is moved to the
//! matching status through the [`JobStore`]. Retries wait on the
//! [`RetryScheduler`] and then loop back into the ensemble.
//!
//! Every path ends in a decision, a partial result or a manual-review ticket.
//! Nothing here ever aborts a job on its own; see [`abort_job`].

use std::{sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};

use crate::{
    config::RecoveryConfig,
    decision::{Action, Decision, DecisionEngine},
    ensemble::{Document, EnsembleController, EnsembleResult, ProcessOptions},
    errors::ProcessingError,
    fields::{ExtractedFields, FieldKind, value_present},
    jobs::{AuditEntry, FailureRecord, JobStatus, JobStore, ProcessingJob, TransitionError},
    prelude::*,
    preprocess::{PreprocessPreset, Preprocessor},
};

use self::{
    classify::{FailureCounters, FailureType, RecoveryStrategy, classify, select_strategy},
    scheduler::RetryScheduler,
};

pub mod classify;
pub mod scheduler;

/// Actor name for changes made by the pipeline itself.
pub const SYSTEM_ACTOR: &str = "system";

/// Fields a partial result needs some of.
const PARTIAL_KEY_FIELDS: [FieldKind; 3] = [
    FieldKind::DocumentNumber,
    FieldKind::IssueDate,
    FieldKind::SellerName,
];

/// Where a job ended up after [`FallbackManager::process_document`].
#[derive(Clone, Debug)]
pub struct DocumentOutcome {
    pub job: ProcessingJob,

    /// The latest ensemble run, if we got that far.
    pub ensemble: Option<EnsembleResult>,

    /// The decision, if an attempt succeeded.
    pub decision: Option<Decision>,

    pub failures: Vec<FailureRecord>,
}

/// A failed attempt, with whatever the ensemble managed to produce.
struct AttemptFailure {
    error: ProcessingError,
    ensemble: Option<EnsembleResult>,
}

/// What a failure does to a job.
#[derive(Clone, Debug)]
enum Recovery {
    Retry {
        status: JobStatus,
        delay: Duration,
        counts_as_retry: bool,
        preset: Option<PreprocessPreset>,
        engine: Option<String>,
    },
    Partial {
        confidence: f64,
        data: Value,
    },
    Review {
        reason: String,
    },
}

impl Recovery {
    fn apply(&self, snapshot: &ProcessingJob) -> ProcessingJob {
        let now = Utc::now();
        match self {
            Recovery::Retry {
                status,
                delay,
                counts_as_retry,
                preset,
                engine,
            } => {
                let mut job = snapshot.with_status(*status);
                if *counts_as_retry {
                    job.retry_count += 1;
                }
                if let Some(preset) = preset {
                    job.preprocessing = Some(*preset);
                }
                if let Some(engine) = engine {
                    job.preferred_engine = Some(engine.clone());
                    job.engine_switches += 1;
                }
                job.next_retry_at = TimeDelta::from_std(*delay).ok().map(|d| now + d);
                job
            }
            Recovery::Partial { confidence, data } => {
                let mut job = snapshot.with_status(JobStatus::PartialSuccess);
                job.action = Some(Action::PartialSuccess);
                job.confidence = Some(*confidence);
                job.extracted_data = Some(data.clone());
                job.manual_review_reason =
                    Some("partial result accepted; missing fields need review".to_owned());
                job.queued_at = Some(now);
                job.next_retry_at = None;
                job
            }
            Recovery::Review { reason } => {
                let mut job = snapshot.with_status(JobStatus::ManualReviewRequired);
                job.action = Some(Action::ManualReview);
                job.manual_review_reason = Some(reason.clone());
                job.queued_at = Some(now);
                job.next_retry_at = None;
                job
            }
        }
    }

    /// How long to wait before retrying, if this is a retry.
    fn retry_delay(&self) -> Option<Duration> {
        match self {
            Recovery::Retry { delay, .. } => Some(*delay),
            _ => None,
        }
    }
}

/// Drives jobs through preprocessing, the ensemble, decisions and recovery.
pub struct FallbackManager {
    store: Arc<JobStore>,
    ensemble: Arc<EnsembleController>,
    preprocessor: Arc<dyn Preprocessor>,
    decision: DecisionEngine,
    config: RecoveryConfig,
    initial_preset: Option<PreprocessPreset>,
    scheduler: RetryScheduler,
}

impl FallbackManager {
    pub fn new(
        store: Arc<JobStore>,
        ensemble: Arc<EnsembleController>,
        preprocessor: Arc<dyn Preprocessor>,
        decision: DecisionEngine,
        config: RecoveryConfig,
        scheduler: RetryScheduler,
    ) -> Self {
        Self {
            store,
            ensemble,
            preprocessor,
            decision,
            config,
            initial_preset: None,
            scheduler,
        }
    }

    /// Preprocess first attempts with `preset`.
    pub fn with_initial_preset(mut self, preset: Option<PreprocessPreset>) -> Self {
        self.initial_preset = preset;
        self
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Create a job for a document, or return the existing one.
    pub fn register(&self, id: &str, content_ref: PathBuf, mime_type: String) -> ProcessingJob {
        let mut job = ProcessingJob::new(id.to_owned(), content_ref, mime_type);
        job.preprocessing = self.initial_preset;
        let registered = self.store.register(job);
        if registered.version == 0 && self.store.audit_log(id).is_empty() {
            self.store
                .audit(AuditEntry::new(id, SYSTEM_ACTOR, "created", None));
        }
        registered
    }

    /// Process a job until it succeeds, needs a human, or is stopped.
    #[instrument(level = "debug", skip_all, fields(job_id = %job_id))]
    pub async fn process_document(&self, job_id: &str) -> Result<DocumentOutcome> {
        let job = self
            .store
            .get(job_id)
            .ok_or_else(|| anyhow!("no job with id {job_id:?}"))?;
        if job.status.is_final() || job.status.awaits_review() {
            debug!(status = %job.status, "Job needs no processing");
            return Ok(self.outcome(job, None, None));
        }

        let mut content: Option<Arc<[u8]>> = None;
        let mut last_ensemble = None;
        loop {
            let job = match self
                .store
                .transition(job_id, |job| {
                    let mut next = job.with_status(JobStatus::Processing);
                    next.next_retry_at = None;
                    Ok(next)
                })
                .await
            {
                Ok(job) => job,
                Err(err) => return self.stopped(job_id, err, last_ensemble),
            };

            let attempt = match &content {
                Some(content) => self.attempt(&job, content.clone()).await,
                None => match tokio::fs::read(&job.content_ref).await {
                    Ok(bytes) => {
                        let bytes = content.insert(Arc::from(bytes)).clone();
                        self.attempt(&job, bytes).await
                    }
                    // Unreadable documents go through recovery like any other
                    // failure, and are read again on the next attempt.
                    Err(err) => Err(AttemptFailure {
                        error: ProcessingError::Resource(format!(
                            "cannot read {}: {err}",
                            job.content_ref.display()
                        )),
                        ensemble: None,
                    }),
                },
            };

            match attempt {
                Ok((ensemble, decision)) => {
                    return self.finish(&job, ensemble, decision).await;
                }
                Err(failure) => {
                    if failure.ensemble.is_some() {
                        last_ensemble = failure.ensemble;
                    }
                    let (job, recovery) = match self
                        .handle_failure(&job, &failure.error, last_ensemble.as_ref())
                        .await
                    {
                        Ok(handled) => handled,
                        Err(err) => return self.stopped(job_id, err, last_ensemble),
                    };
                    match recovery.retry_delay() {
                        Some(delay) => {
                            debug!(status = %job.status, ?delay, "Waiting to retry");
                            self.scheduler.wait(job_id, delay).await?;
                        }
                        None => return Ok(self.outcome(job, last_ensemble, None)),
                    }
                }
            }
        }
    }

    /// One attempt: preprocess, run the ensemble, decide.
    #[instrument(level = "debug", skip_all, fields(preset = ?job.preprocessing, engine = ?job.preferred_engine))]
    async fn attempt(
        &self,
        job: &ProcessingJob,
        content: Arc<[u8]>,
    ) -> Result<(EnsembleResult, Decision), AttemptFailure> {
        let content = match job.preprocessing {
            Some(preset) => self
                .preprocessor
                .preprocess(content, &job.mime_type, preset)
                .await
                .map_err(|error| AttemptFailure {
                    error,
                    ensemble: None,
                })?,
            None => content,
        };

        let document = Document {
            id: job.id.clone(),
            content,
            mime_type: job.mime_type.clone(),
        };
        let options = ProcessOptions {
            engines: job.preferred_engine.clone().map(|engine| vec![engine]),
            preset: job.preprocessing,
        };
        let ensemble = self.ensemble.process(&document, &options).await;
        if let Some(error) = ensemble.failure() {
            return Err(AttemptFailure {
                error,
                ensemble: Some(ensemble),
            });
        }

        let fields = ensemble.best().map(|best| &best.fields);
        if !fields.is_some_and(|fields| fields.values().any(|f| value_present(&f.value))) {
            return Err(AttemptFailure {
                error: ProcessingError::Extraction(
                    "no invoice fields found in the best result".to_owned(),
                ),
                ensemble: Some(ensemble),
            });
        }
        let empty = ExtractedFields::new();
        let decision = self
            .decision
            .decide(ensemble.confidence, fields.unwrap_or(&empty));

        // A low-confidence result with structural problems is an extraction
        // failure, which recovery may still salvage as a partial result.
        if decision.action == Action::Reject && !decision.validation_errors.is_empty() {
            let summary = decision.validation_errors.join("; ");
            let error = if summary.contains("missing") {
                ProcessingError::Extraction(format!("incomplete extraction: {summary}"))
            } else {
                ProcessingError::Validation(summary)
            };
            return Err(AttemptFailure {
                error,
                ensemble: Some(ensemble),
            });
        }
        Ok((ensemble, decision))
    }

    /// Record a decision on the job.
    async fn finish(
        &self,
        job: &ProcessingJob,
        ensemble: EnsembleResult,
        decision: Decision,
    ) -> Result<DocumentOutcome> {
        let status = match decision.action {
            Action::AutoAccept | Action::AcceptFlagged => JobStatus::Completed,
            Action::ManualReview => JobStatus::ManualReviewRequired,
            Action::PartialSuccess => JobStatus::PartialSuccess,
            Action::Reject => JobStatus::Rejected,
        };
        let reason = (status == JobStatus::ManualReviewRequired).then(|| {
            if decision.validation_errors.is_empty() {
                format!(
                    "confidence {:.3} is below the auto-accept threshold {:.2}",
                    decision.confidence, decision.thresholds.auto_create
                )
            } else {
                format!(
                    "validation errors: {}",
                    decision.validation_errors.join("; ")
                )
            }
        });
        let data = ensemble.best().map(|best| field_values(&best.fields));

        let updated = self.store.transition(&job.id, |snapshot| {
            let mut next = snapshot.with_status(status);
            next.action = Some(decision.action);
            next.confidence = Some(decision.confidence);
            next.extracted_data = data.clone();
            if let Some(reason) = &reason {
                next.manual_review_reason = Some(reason.clone());
                next.queued_at = Some(Utc::now());
            }
            Ok(next)
        });
        let job = match updated.await {
            Ok(job) => job,
            Err(err) => return self.stopped(&job.id, err, Some(ensemble)),
        };
        info!(
            action = %decision.action,
            status = %job.status,
            confidence = decision.confidence,
            "Decision made"
        );
        self.store.audit(AuditEntry::new(
            &job.id,
            SYSTEM_ACTOR,
            "decision",
            Some(format!("{} at confidence {:.3}", decision.action, decision.confidence)),
        ));
        Ok(self.outcome(job, Some(ensemble), Some(decision)))
    }

    /// Classify a failure, choose a strategy and move the job along.
    #[instrument(level = "debug", skip_all, fields(error_type = %error.label()))]
    async fn handle_failure(
        &self,
        job: &ProcessingJob,
        error: &ProcessingError,
        ensemble: Option<&EnsembleResult>,
    ) -> Result<(ProcessingJob, Recovery), TransitionError> {
        let failure_type = classify(error);
        let history = self.store.failures(&job.id);
        let counters = FailureCounters {
            type_failures: history
                .iter()
                .filter(|record| record.failure_type == failure_type)
                .count(),
            total_failures: history.len() + 1,
        };
        let selected = select_strategy(
            failure_type,
            counters,
            &self.config.policies,
            self.config.max_total_failures,
        );
        let (strategy, recovery) =
            self.plan_recovery(job, failure_type, selected, counters, error, ensemble);
        warn!(
            %failure_type,
            %selected,
            %strategy,
            total_failures = counters.total_failures,
            %error,
            "Processing attempt failed"
        );

        self.store.record_failure(
            &job.id,
            FailureRecord {
                failure_type,
                error_type: error.label().to_owned(),
                message: error.to_string(),
                strategy,
                retry_count: job.retry_count,
                total_failures: counters.total_failures,
                at: Utc::now(),
            },
        );
        let next = self
            .store
            .transition(&job.id, |snapshot| Ok(recovery.apply(snapshot)))
            .await?;
        self.store.audit(AuditEntry::new(
            &job.id,
            SYSTEM_ACTOR,
            "recovery",
            Some(format!("{failure_type}: {strategy}, now {}", next.status)),
        ));
        Ok((next, recovery))
    }

    /// Turn a strategy into a concrete change, falling through to manual
    /// review when the strategy has nothing left to try. Returns the strategy
    /// actually used.
    fn plan_recovery(
        &self,
        job: &ProcessingJob,
        failure_type: FailureType,
        selected: RecoveryStrategy,
        counters: FailureCounters,
        error: &ProcessingError,
        ensemble: Option<&EnsembleResult>,
    ) -> (RecoveryStrategy, Recovery) {
        let policy = self.config.policies.policy(failure_type);
        let in_budget = counters.type_failures < policy.max_retries;
        let delay = self.config.scaled_delay(policy.delay_secs);
        let review = |reason: String| {
            (
                RecoveryStrategy::ManualReview,
                Recovery::Review { reason },
            )
        };

        match selected {
            RecoveryStrategy::RetrySameEngine => (
                selected,
                Recovery::Retry {
                    status: JobStatus::RetryScheduled,
                    delay,
                    counts_as_retry: in_budget,
                    preset: None,
                    engine: None,
                },
            ),
            RecoveryStrategy::RetryWithPreprocessing => {
                match PreprocessPreset::next_after(job.preprocessing) {
                    Some(preset) => (
                        selected,
                        Recovery::Retry {
                            status: JobStatus::RetryWithPreprocessing,
                            delay,
                            counts_as_retry: in_budget,
                            preset: Some(preset),
                            engine: None,
                        },
                    ),
                    None => review(format!(
                        "every preprocessing preset has been tried; last error: {error}"
                    )),
                }
            }
            RecoveryStrategy::RetryWithLighterPreprocessing => (
                selected,
                Recovery::Retry {
                    status: JobStatus::RetryWithPreprocessing,
                    delay,
                    counts_as_retry: in_budget,
                    preset: Some(PreprocessPreset::Minimal),
                    engine: None,
                },
            ),
            RecoveryStrategy::SwitchEngine => {
                match self.ensemble.next_engine_after(job.preferred_engine.as_deref()) {
                    Some(engine) => (
                        selected,
                        Recovery::Retry {
                            status: JobStatus::RetryWithDifferentEngine,
                            delay: Duration::ZERO,
                            counts_as_retry: false,
                            preset: None,
                            engine: Some(engine),
                        },
                    ),
                    None => review(format!(
                        "no other engine is available; last error: {error}"
                    )),
                }
            }
            RecoveryStrategy::PartialSuccess => {
                let partial = ensemble.and_then(|ensemble| {
                    let best = ensemble.best()?;
                    accepts_partial(&best.fields, ensemble.confidence, &self.config)
                        .then(|| (ensemble.confidence, field_values(&best.fields)))
                });
                match partial {
                    Some((confidence, data)) => (selected, Recovery::Partial { confidence, data }),
                    None => review(format!("no usable partial result; last error: {error}")),
                }
            }
            RecoveryStrategy::ManualReview | RecoveryStrategy::Abort => review(format!(
                "{} failures; last was {failure_type}: {error}",
                counters.total_failures
            )),
        }
    }

    /// Someone else moved the job while we were working on it, usually an
    /// operator aborting it. Report where it is now.
    fn stopped(
        &self,
        job_id: &str,
        err: TransitionError,
        ensemble: Option<EnsembleResult>,
    ) -> Result<DocumentOutcome> {
        match (&err, self.store.get(job_id)) {
            (TransitionError::Illegal { .. }, Some(job))
                if job.status.is_final() || job.status.awaits_review() =>
            {
                info!(status = %job.status, "Job was moved elsewhere; stopping");
                Ok(self.outcome(job, ensemble, None))
            }
            _ => Err(err).with_context(|| format!("cannot update job {job_id:?}")),
        }
    }

    fn outcome(
        &self,
        job: ProcessingJob,
        ensemble: Option<EnsembleResult>,
        decision: Option<Decision>,
    ) -> DocumentOutcome {
        let failures = self.store.failures(&job.id);
        DocumentOutcome {
            job,
            ensemble,
            decision,
            failures,
        }
    }
}

/// Does a result have enough key fields, with enough confidence, to accept
/// as a partial success?
pub fn accepts_partial(fields: &ExtractedFields, confidence: f64, config: &RecoveryConfig) -> bool {
    let present = PARTIAL_KEY_FIELDS
        .iter()
        .filter(|kind| {
            fields
                .get(kind.as_str())
                .is_some_and(|field| value_present(&field.value))
        })
        .count();
    present >= config.partial_success_min_fields
        && confidence >= config.partial_success_min_confidence
}

/// Field values without scoring details.
pub fn field_values(fields: &ExtractedFields) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(name, field)| (name.clone(), field.value.clone()))
            .collect(),
    )
}

/// Stop a job for good. Only operators do this.
#[instrument(level = "debug", skip(store, reason))]
pub async fn abort_job(
    store: &JobStore,
    job_id: &str,
    operator: &str,
    reason: &str,
) -> Result<ProcessingJob, TransitionError> {
    let job = store
        .transition(job_id, |snapshot| {
            let mut next = snapshot.with_status(JobStatus::ProcessingAborted);
            next.manual_review_reason = Some(reason.to_owned());
            next.next_retry_at = None;
            Ok(next)
        })
        .await?;
    warn!(%job_id, %operator, %reason, "Job aborted");
    store.audit(AuditEntry::new(
        job_id,
        operator,
        "aborted",
        Some(reason.to_owned()),
    ));
    Ok(job)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use serde_json::json;

    use super::*;
    use crate::{
        config::{DecisionConfig, EnsembleConfig, MonitorConfig, ScoringMode},
        confidence::{ConfidenceCalculator, tests::clean_invoice_fields},
        decision::DecisionStrategy,
        engines::{
            EngineOutput,
            testing::{Script, ScriptedEngine},
        },
        ensemble::RegisteredEngine,
        fields::{RawField, RawFields},
        monitor::EngineMonitor,
        preprocess::{PassthroughPreprocessor, tests::RecordingPreprocessor},
        review::ManualReviewQueue,
    };

    struct Harness {
        manager: FallbackManager,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(
            engines: &[(Arc<ScriptedEngine>, f64)],
            preprocessor: Arc<dyn Preprocessor>,
            initial_preset: Option<PreprocessPreset>,
            timeout: Duration,
        ) -> Self {
            let registered = engines
                .iter()
                .map(|(engine, weight)| RegisteredEngine {
                    engine: engine.clone(),
                    weight: *weight,
                    timeout,
                })
                .collect();
            let ensemble_config = EnsembleConfig {
                scoring: ScoringMode::EngineReported,
                cache: crate::config::CacheConfig {
                    enabled: false,
                    ..Default::default()
                },
                ..EnsembleConfig::default()
            };
            let monitor = Arc::new(EngineMonitor::new(&MonitorConfig {
                failure_threshold: 100,
                ..MonitorConfig::default()
            }));
            let ensemble = Arc::new(EnsembleController::new(
                registered,
                &ensemble_config,
                ConfidenceCalculator::default(),
                monitor,
            ));
            let (scheduler, _worker) = RetryScheduler::start();
            let manager = FallbackManager::new(
                JobStore::new(),
                ensemble,
                preprocessor,
                DecisionEngine::new(&DecisionConfig::default(), DecisionStrategy::Standard),
                RecoveryConfig {
                    delay_scale: 0.0,
                    ..RecoveryConfig::default()
                },
                scheduler,
            )
            .with_initial_preset(initial_preset);

            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("invoice.pdf");
            std::fs::write(&path, b"%PDF-1.7 fake").unwrap();
            manager.register("doc-1", path, "application/pdf".to_owned());
            Self { manager, _dir: dir }
        }

        fn simple(engines: &[(Arc<ScriptedEngine>, f64)]) -> Self {
            Self::new(
                engines,
                Arc::new(PassthroughPreprocessor),
                None,
                Duration::from_secs(5),
            )
        }

        async fn run(&self) -> DocumentOutcome {
            self.manager.process_document("doc-1").await.unwrap()
        }
    }

    fn engine(name: &str, steps: Vec<Script>) -> Arc<ScriptedEngine> {
        Arc::new(ScriptedEngine::new(name, steps))
    }

    /// A complete, consistent invoice at the given reported confidence.
    fn full_output(confidence: f64) -> EngineOutput {
        EngineOutput {
            fields: clean_invoice_fields(),
            confidence: Some(confidence),
            ..EngineOutput::default()
        }
    }

    /// Only some fields, at the given reported confidence.
    fn partial_output(confidence: f64, fields: &[(&str, &str)]) -> EngineOutput {
        let fields = fields
            .iter()
            .map(|(name, value)| {
                (
                    (*name).to_owned(),
                    RawField {
                        value: json!(value),
                        confidence: None,
                        bbox: None,
                    },
                )
            })
            .collect::<RawFields>();
        EngineOutput {
            fields,
            confidence: Some(confidence),
            ..EngineOutput::default()
        }
    }

    fn strategies(outcome: &DocumentOutcome) -> Vec<RecoveryStrategy> {
        outcome.failures.iter().map(|f| f.strategy).collect()
    }

    #[tokio::test]
    async fn confident_results_are_accepted() {
        let harness = Harness::simple(&[(
            engine("primary", vec![Script::Succeed(full_output(0.95))]),
            0.5,
        )]);
        let outcome = harness.run().await;
        assert_eq!(outcome.job.status, JobStatus::Completed);
        assert_eq!(outcome.job.action, Some(Action::AutoAccept));
        assert_eq!(outcome.decision.unwrap().action, Action::AutoAccept);
        assert!(outcome.failures.is_empty());
        assert_eq!(
            outcome.job.extracted_data.unwrap()["document_number"],
            json!("FV/2024/03/117")
        );
        let actions = harness
            .manager
            .store()
            .audit_log("doc-1")
            .into_iter()
            .map(|entry| entry.action)
            .collect::<Vec<_>>();
        assert_eq!(actions, ["created", "decision"]);
    }

    #[tokio::test]
    async fn middling_confidence_goes_to_review() {
        let harness = Harness::simple(&[(
            engine("primary", vec![Script::Succeed(full_output(0.72))]),
            0.5,
        )]);
        let outcome = harness.run().await;
        assert_eq!(outcome.job.status, JobStatus::ManualReviewRequired);
        assert!(outcome.job.queued_at.is_some());
        assert!(
            outcome
                .job
                .manual_review_reason
                .as_deref()
                .unwrap()
                .contains("0.720")
        );
        assert_eq!(outcome.decision.unwrap().action, Action::ManualReview);
    }

    #[tokio::test]
    async fn clean_low_confidence_results_are_rejected() {
        let harness = Harness::simple(&[(
            engine("primary", vec![Script::Succeed(full_output(0.3))]),
            0.5,
        )]);
        let outcome = harness.run().await;
        assert_eq!(outcome.job.status, JobStatus::Rejected);
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn repeated_timeouts_escalate() {
        let preprocessor = Arc::new(RecordingPreprocessor::default());
        let harness = Harness::new(
            &[(engine("primary", vec![Script::Hang]), 0.5)],
            preprocessor.clone(),
            None,
            Duration::from_millis(50),
        );
        let outcome = harness.run().await;

        // First timeout: lighter preprocessing. Second: the timeout budget of
        // one is spent, so no third same-type retry.
        assert_eq!(
            strategies(&outcome),
            [
                RecoveryStrategy::RetryWithLighterPreprocessing,
                RecoveryStrategy::ManualReview
            ]
        );
        assert!(
            outcome
                .failures
                .iter()
                .all(|f| f.failure_type == FailureType::Timeout)
        );
        assert_eq!(
            *preprocessor.presets.lock().unwrap(),
            [PreprocessPreset::Minimal]
        );
        assert_eq!(outcome.job.retry_count, 1);
        assert_eq!(outcome.job.status, JobStatus::ManualReviewRequired);
        assert!(outcome.ensemble.unwrap().results[0].is_timeout());
    }

    #[tokio::test]
    async fn exhausted_engine_retries_switch_engines() {
        let primary = engine("primary", vec![Script::Fail("model crashed".into())]);
        let mut steps = vec![Script::Fail("model crashed".into()); 3];
        steps.push(Script::Succeed(full_output(0.95)));
        let secondary = engine("secondary", steps);
        let harness = Harness::simple(&[(primary.clone(), 0.5), (secondary.clone(), 0.3)]);
        let outcome = harness.run().await;

        assert_eq!(
            strategies(&outcome),
            [
                RecoveryStrategy::RetrySameEngine,
                RecoveryStrategy::RetrySameEngine,
                RecoveryStrategy::SwitchEngine
            ]
        );
        assert_eq!(outcome.job.status, JobStatus::Completed);
        assert_eq!(outcome.job.retry_count, 2);
        assert_eq!(outcome.job.engine_switches, 1);
        assert_eq!(outcome.job.preferred_engine.as_deref(), Some("secondary"));
        // The switched attempt only called the new engine.
        assert_eq!(primary.calls(), 3);
        assert_eq!(secondary.calls(), 4);
        let ensemble = outcome.ensemble.unwrap();
        assert_eq!(
            ensemble.engines_used,
            BTreeSet::from(["secondary".to_owned()])
        );
        assert!(ensemble.fallback_used);
    }

    #[tokio::test]
    async fn preprocessing_failures_walk_the_presets() {
        let preprocessor = Arc::new(RecordingPreprocessor {
            fail: true,
            ..Default::default()
        });
        let primary = engine("primary", vec![Script::Succeed(full_output(0.95))]);
        let harness = Harness::new(
            &[(primary.clone(), 0.5)],
            preprocessor.clone(),
            Some(PreprocessPreset::Standard),
            Duration::from_secs(5),
        );
        let outcome = harness.run().await;

        assert_eq!(
            *preprocessor.presets.lock().unwrap(),
            PreprocessPreset::ORDER
        );
        assert_eq!(primary.calls(), 0);
        assert_eq!(outcome.job.status, JobStatus::ManualReviewRequired);
        assert_eq!(outcome.job.retry_count, 3);
        assert_eq!(outcome.failures.len(), 4);
        assert_eq!(
            outcome.failures.last().unwrap().strategy,
            RecoveryStrategy::ManualReview
        );
        assert!(
            outcome
                .job
                .manual_review_reason
                .unwrap()
                .contains("every preprocessing preset")
        );
    }

    #[tokio::test]
    async fn partial_results_need_enough_confidence() {
        let fields = [("document_number", "FV/1/2024"), ("issue_date", "2024-03-15")];

        let harness = Harness::simple(&[(
            engine("primary", vec![Script::Succeed(partial_output(0.35, &fields))]),
            0.5,
        )]);
        let outcome = harness.run().await;
        assert_eq!(outcome.job.status, JobStatus::PartialSuccess);
        assert_eq!(outcome.job.action, Some(Action::PartialSuccess));
        assert!(outcome.job.queued_at.is_some());
        assert_eq!(outcome.failures[0].failure_type, FailureType::Extraction);

        let harness = Harness::simple(&[(
            engine("primary", vec![Script::Succeed(partial_output(0.25, &fields))]),
            0.5,
        )]);
        let outcome = harness.run().await;
        assert_eq!(outcome.job.status, JobStatus::ManualReviewRequired);
        assert_eq!(strategies(&outcome), [RecoveryStrategy::ManualReview]);
    }

    #[test]
    fn partial_acceptance_rules() {
        let config = RecoveryConfig::default();
        let calc = ConfidenceCalculator::default();
        let mut raw = clean_invoice_fields();
        raw.retain(|name, _| name == "document_number" || name == "issue_date");
        let fields = calc.score(&raw, &[], None).fields;
        assert!(accepts_partial(&fields, 0.35, &config));
        assert!(accepts_partial(&fields, 0.30, &config));
        assert!(!accepts_partial(&fields, 0.25, &config));

        raw.retain(|name, _| name == "document_number");
        let fields = calc.score(&raw, &[], None).fields;
        assert!(!accepts_partial(&fields, 0.9, &config));
    }

    #[tokio::test]
    async fn five_mixed_failures_go_to_review() {
        let harness = Harness::simple(&[(
            engine("primary", vec![Script::Succeed(full_output(0.95))]),
            0.5,
        )]);
        let store = harness.manager.store().clone();
        for failure_type in [
            FailureType::Engine,
            FailureType::Timeout,
            FailureType::Preprocessing,
            FailureType::Resource,
        ] {
            store.record_failure(
                "doc-1",
                FailureRecord {
                    failure_type,
                    error_type: "Error".into(),
                    message: "earlier".into(),
                    strategy: RecoveryStrategy::RetrySameEngine,
                    retry_count: 0,
                    total_failures: 0,
                    at: Utc::now(),
                },
            );
        }
        let job = store
            .transition("doc-1", |job| Ok(job.with_status(JobStatus::Processing)))
            .await
            .unwrap();

        // Network errors have three retries left, but this is failure five.
        let error = ProcessingError::Network("connection reset by peer".into());
        let (job, recovery) = harness
            .manager
            .handle_failure(&job, &error, None)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::ManualReviewRequired);
        assert!(matches!(recovery, Recovery::Review { .. }));
        let last = store.failures("doc-1").pop().unwrap();
        assert_eq!(last.failure_type, FailureType::Network);
        assert_eq!(last.total_failures, 5);
        assert_eq!(last.strategy, RecoveryStrategy::ManualReview);
    }

    #[tokio::test]
    async fn unreadable_documents_end_up_in_review() {
        let primary = engine("primary", vec![Script::Succeed(full_output(0.95))]);
        let harness = Harness::simple(&[(primary.clone(), 0.5)]);
        harness.manager.register(
            "missing",
            PathBuf::from("/nonexistent/invoice.pdf"),
            "application/pdf".into(),
        );
        let outcome = harness.manager.process_document("missing").await.unwrap();
        assert_eq!(outcome.job.status, JobStatus::ManualReviewRequired);
        assert!(
            outcome
                .job
                .manual_review_reason
                .as_deref()
                .unwrap()
                .contains("cannot read")
        );
        assert_eq!(primary.calls(), 0);

        // Two policy retries, then the third failure escalates.
        let types = outcome
            .failures
            .iter()
            .map(|failure| failure.failure_type)
            .collect::<Vec<_>>();
        assert_eq!(types, vec![FailureType::Resource; 3]);
        assert_eq!(
            outcome.failures.last().unwrap().strategy,
            RecoveryStrategy::ManualReview
        );
        let store = harness.manager.store();
        let pending = ManualReviewQueue::new(store.clone()).list_pending(None, 10);
        assert!(pending.iter().any(|ticket| ticket.job_id == "missing"));

        // An operator can still stop it.
        let job = abort_job(store, "missing", "ops", "file was deleted")
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::ProcessingAborted);
    }

    #[tokio::test]
    async fn aborted_jobs_stay_aborted() {
        let harness = Harness::simple(&[(
            engine("primary", vec![Script::Succeed(full_output(0.72))]),
            0.5,
        )]);
        harness.run().await;
        let store = harness.manager.store();

        let job = abort_job(store, "doc-1", "ops", "duplicate upload")
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::ProcessingAborted);
        let last = store.audit_log("doc-1").pop().unwrap();
        assert_eq!((last.actor.as_str(), last.action.as_str()), ("ops", "aborted"));

        let err = abort_job(store, "doc-1", "ops", "again").await.unwrap_err();
        assert!(matches!(err, TransitionError::Illegal { .. }));

        let outcome = harness.run().await;
        assert_eq!(outcome.job.status, JobStatus::ProcessingAborted);
    }
}
