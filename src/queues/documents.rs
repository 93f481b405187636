//! Processing a stream of invoice documents.

use std::{collections::BTreeSet, sync::Arc};

use futures::{FutureExt as _, StreamExt as _};
use schemars::JsonSchema;

use crate::{
    async_utils::{BoxedFuture, BoxedStream, JoinWorker},
    confidence::{BucketThresholds, ConfidenceBucket},
    decision::{Action, ReviewHint},
    jobs::{FailureRecord, JobStatus},
    prelude::*,
    recovery::{DocumentOutcome, FallbackManager},
};

use super::work::{WorkFn, WorkInput, WorkOutput, WorkQueue, WorkStatus};

/// An input record describing an invoice to process.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct DocumentInput {
    /// The path to the invoice: a PDF, an image, or a JSON recording for
    /// replay engines.
    pub path: PathBuf,

    /// Overrides MIME type detection.
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// An output record describing where an invoice ended up.
#[derive(Clone, Debug, Default, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct DocumentOutput {
    /// The input path.
    pub path: PathBuf,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_status: Option<JobStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_bucket: Option<ConfidenceBucket>,

    /// The engine whose result was chosen.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,

    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub engines_used: BTreeSet<String>,

    pub fallback_used: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_data: Option<Value>,

    /// Why a human needs to look at this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_reason: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub review_hints: Vec<ReviewHint>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub validation_errors: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<FailureRecord>,

    pub retry_count: usize,
}

impl DocumentOutput {
    fn from_outcome(path: PathBuf, outcome: DocumentOutcome, buckets: &BucketThresholds) -> Self {
        let DocumentOutcome {
            job,
            ensemble,
            decision,
            failures,
        } = outcome;
        let engine = ensemble
            .as_ref()
            .filter(|ensemble| !ensemble.failed)
            .and_then(|ensemble| ensemble.best())
            .map(|best| best.engine.clone());
        let (review_hints, validation_errors) = decision
            .map(|decision| (decision.review_hints, decision.validation_errors))
            .unwrap_or_default();
        let (engines_used, fallback_used) = ensemble
            .map(|ensemble| (ensemble.engines_used, ensemble.fallback_used))
            .unwrap_or_default();
        Self {
            path,
            job_status: Some(job.status),
            action: job.action,
            confidence: job.confidence,
            confidence_bucket: job
                .confidence
                .map(|score| ConfidenceBucket::from_score(score, buckets)),
            engine,
            engines_used,
            fallback_used,
            extracted_data: job.extracted_data,
            review_reason: job.manual_review_reason,
            review_hints,
            validation_errors,
            failures,
            retry_count: job.retry_count,
        }
    }
}

/// How a job's status is reported in the output stream.
fn work_status(status: JobStatus) -> WorkStatus {
    match status {
        JobStatus::Completed => WorkStatus::Ok,
        JobStatus::PartialSuccess => WorkStatus::Incomplete,
        JobStatus::ManualReviewRequired => WorkStatus::Review,
        JobStatus::Rejected => WorkStatus::Rejected,
        _ => WorkStatus::Failed,
    }
}

/// Turn a record ID into a job ID.
pub fn job_id_for(id: &Value) -> String {
    match id {
        Value::String(id) => id.clone(),
        other => other.to_string(),
    }
}

/// Guess the MIME type of a document, first by sniffing its contents and
/// then by its extension.
pub fn detect_mime_type(path: &Path) -> Result<String> {
    if let Ok(Some(kind)) = infer::get_from_path(path) {
        return Ok(kind.mime_type().to_owned());
    }
    mime_guess::from_path(path)
        .first()
        .map(|mime| mime.essence_str().to_owned())
        .ok_or_else(|| anyhow!("cannot determine the MIME type of {}", path.display()))
}

/// Return value of [`process_documents`].
pub struct DocumentStreamInfo {
    pub stream: BoxedStream<BoxedFuture<Result<WorkOutput<DocumentOutput>>>>,
    pub worker: JoinWorker,
}

/// Process a stream of documents, up to `job_count` at a time.
#[instrument(level = "debug", skip_all)]
pub fn process_documents(
    input: BoxedStream<Result<WorkInput<DocumentInput>>>,
    job_count: usize,
    manager: Arc<FallbackManager>,
    buckets: BucketThresholds,
) -> DocumentStreamInfo {
    let buckets = Arc::new(buckets);
    let work_fn: WorkFn<DocumentInput, DocumentOutput> =
        Arc::new(move |input: WorkInput<DocumentInput>| {
            process_document(input, manager.clone(), buckets.clone()).boxed()
        });
    let (queue, worker) = WorkQueue::new(job_count, work_fn);
    let stream = queue.handle().process_stream(input);
    DocumentStreamInfo { stream, worker }
}

/// Register one document and drive it to a resting state.
#[instrument(level = "debug", skip_all, fields(id = %input.id))]
async fn process_document(
    input: WorkInput<DocumentInput>,
    manager: Arc<FallbackManager>,
    buckets: Arc<BucketThresholds>,
) -> Result<WorkOutput<DocumentOutput>> {
    let id = input.id;
    let DocumentInput { path, mime_type } = input.data;
    let failed = |error: anyhow::Error, path: PathBuf| {
        WorkOutput::new_failed(id.clone(), vec![format!("{error:#}")], DocumentOutput {
            path,
            ..DocumentOutput::default()
        })
    };

    let mime_type = match mime_type {
        Some(mime_type) => mime_type,
        None => match detect_mime_type(&path) {
            Ok(mime_type) => mime_type,
            Err(err) => return Ok(failed(err, path)),
        },
    };
    let job_id = job_id_for(&id);
    manager.register(&job_id, path.clone(), mime_type);
    let outcome = match manager.process_document(&job_id).await {
        Ok(outcome) => outcome,
        Err(err) => return Ok(failed(err, path)),
    };

    let status = work_status(outcome.job.status);
    let errors = outcome
        .failures
        .iter()
        .map(|failure| format!("{}: {}", failure.failure_type, failure.message))
        .collect();
    Ok(WorkOutput {
        id,
        status,
        errors,
        data: DocumentOutput::from_outcome(path, outcome, &buckets),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::stream;
    use serde_json::json;

    use super::*;
    use crate::{
        config::{DecisionConfig, RecoveryConfig},
        confidence::tests::clean_invoice_fields,
        decision::{DecisionEngine, DecisionStrategy},
        engines::{
            EngineOutput,
            testing::{Script, ScriptedEngine},
        },
        ensemble::tests::controller,
        jobs::JobStore,
        preprocess::PassthroughPreprocessor,
        recovery::scheduler::RetryScheduler,
    };

    #[test]
    fn job_ids_come_from_record_ids() {
        assert_eq!(job_id_for(&json!("inv-7")), "inv-7");
        assert_eq!(job_id_for(&json!(42)), "42");
    }

    #[test]
    fn mime_types_fall_back_to_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("scan.bin");
        // PNG magic number.
        std::fs::write(&png, b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR").unwrap();
        assert_eq!(detect_mime_type(&png).unwrap(), "image/png");

        let recording = dir.path().join("invoice.json");
        std::fs::write(&recording, b"{}").unwrap();
        assert_eq!(detect_mime_type(&recording).unwrap(), "application/json");

        assert!(detect_mime_type(&dir.path().join("mystery")).is_err());
    }

    #[tokio::test]
    async fn processes_a_stream_of_documents() {
        let engine = Arc::new(ScriptedEngine::new("primary", vec![Script::Succeed(
            EngineOutput {
                fields: clean_invoice_fields(),
                confidence: Some(0.95),
                ..EngineOutput::default()
            },
        )]));
        let (scheduler, _scheduler_worker) = RetryScheduler::start();
        let store = JobStore::new();
        let manager = Arc::new(FallbackManager::new(
            store.clone(),
            Arc::new(controller(&[(engine, 0.5)], Duration::from_secs(5))),
            Arc::new(PassthroughPreprocessor),
            DecisionEngine::new(&DecisionConfig::default(), DecisionStrategy::Standard),
            RecoveryConfig {
                delay_scale: 0.0,
                ..RecoveryConfig::default()
            },
            scheduler,
        ));

        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("invoice.pdf");
        std::fs::write(&present, b"%PDF-1.7 fake").unwrap();
        let missing = dir.path().join("missing.pdf");
        let untyped = dir.path().join("untyped");
        let inputs = stream::iter([
            json!({"id": "a", "path": present}),
            json!({"id": "b", "path": missing}),
            json!({"id": "c", "path": untyped}),
        ])
        .map(WorkInput::<DocumentInput>::from_json)
        .boxed();

        let DocumentStreamInfo { stream, worker } =
            process_documents(inputs, 3, manager, BucketThresholds::default());
        let outputs = stream
            .buffered(3)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        worker.join().await.unwrap();

        assert_eq!(outputs[0].status, WorkStatus::Ok);
        assert_eq!(outputs[0].data.action, Some(Action::AutoAccept));
        assert_eq!(outputs[0].data.engine.as_deref(), Some("primary"));
        assert_eq!(outputs[0].data.confidence_bucket, Some(ConfidenceBucket::High));
        assert!(outputs[0].errors.is_empty());

        // Unreadable files are retried, then handed to a reviewer.
        assert_eq!(outputs[1].status, WorkStatus::Review);
        assert_eq!(
            outputs[1].data.job_status,
            Some(JobStatus::ManualReviewRequired)
        );
        assert_eq!(outputs[1].errors.len(), 3);
        assert!(outputs[1].errors[0].starts_with("resource_error: cannot read"));

        // Without a MIME type there's no job to register.
        assert_eq!(outputs[2].status, WorkStatus::Failed);
        assert_eq!(outputs[2].data.job_status, None);
        assert_eq!(outputs[2].errors.len(), 1);

        assert_eq!(store.jobs().len(), 2);
    }
}
