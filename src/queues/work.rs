//! Bounded parallel processing of input records.
//!
//! Only a fixed number of documents may be in flight. Submitting another one
//! waits until a slot frees up, so a huge input file never turns into a huge
//! pile of half-finished jobs. See ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html).
//!
//! Callers build a [`WorkQueue`] around a [`WorkFn`] and feed it through a
//! [`WorkQueueHandle`].

use std::sync::{Arc, Mutex};

use futures::{
    FutureExt, SinkExt as _, StreamExt,
    channel::{mpsc, oneshot},
};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;

use crate::{
    async_utils::{
        BoxedFuture, BoxedStream, JoinWorker,
        io::{read_jsonl_or_csv, write_output},
    },
    cmd::StreamOpts,
    prelude::*,
    ui::Ui,
};

/// An input record: an `id` plus record-specific fields.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct WorkInput<T>
where
    T: 'static,
{
    /// Copied to the output record. Also used as the job ID.
    pub id: Value,

    #[serde(flatten)]
    pub data: T,
}

impl<T> WorkInput<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// Parse one record.
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value::<Self>(value).context("failed to deserialize input")
    }

    /// Read JSONL or CSV records from a file, or from standard input.
    pub async fn read_stream(path: Option<&Path>) -> Result<BoxedStream<Result<Self>>> {
        Ok(read_jsonl_or_csv(path)
            .await?
            .map(|value| Self::from_json(value?))
            .boxed())
    }
}

/// Output status of a work item.
#[derive(Clone, Copy, Debug, JsonSchema, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Accepted, automatically or with a flag.
    Ok,

    /// A partial result, pending human follow-up.
    Incomplete,

    /// Waiting for manual review.
    Review,

    /// Rejected as unreliable.
    Rejected,

    /// The item could not be processed.
    Failed,
}

/// An output record: the input `id`, a summary status and record-specific
/// fields.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct WorkOutput<T>
where
    T: 'static,
{
    pub id: Value,

    pub status: WorkStatus,

    /// Everything that went wrong along the way, including failures we
    /// recovered from.
    pub errors: Vec<String>,

    #[serde(flatten)]
    pub data: T,
}

impl<T> WorkOutput<T>
where
    T: Clone + Serialize + Send + 'static,
{
    /// An output for a record we couldn't process at all.
    pub fn new_failed(id: Value, errors: Vec<String>, data: T) -> Self {
        Self {
            id,
            status: WorkStatus::Failed,
            errors,
            data,
        }
    }

    /// Serialize as a JSON object.
    pub fn to_json(&self) -> Result<Value> {
        serde_json::to_value::<Self>((*self).to_owned())
            .context("failed to serialize output")
    }

    /// Write outputs as JSONL, then report the counters. Fails if too many
    /// records failed.
    pub async fn write_stream(
        ui: &Ui,
        path: Option<&Path>,
        stream: BoxedStream<Result<Self>>,
        stream_opts: &StreamOpts,
    ) -> Result<()> {
        let (stream, counters) = WorkOutputCounters::wrap_stream(stream);
        let output = stream
            .map(|value| {
                let value = value?;
                value.to_json()
            })
            .boxed();
        write_output(path, output).await?;
        counters.finish(ui, stream_opts)
    }
}

/// Tallies of output statuses.
#[derive(Clone, Debug, Default)]
pub struct WorkOutputCounters {
    /// How many records did we process?
    pub total_record_count: usize,

    /// How many were accepted?
    pub ok_count: usize,

    /// How many are waiting for a human, including partial results?
    pub review_count: usize,

    /// How many were rejected?
    pub rejected_count: usize,

    /// How many records did we fail to process?
    pub failure_count: usize,

    /// How many non-fatal errors did we encounter?
    pub non_fatal_error_count: usize,
}

impl WorkOutputCounters {
    /// Count outputs as they pass through `stream`.
    pub fn wrap_stream<T>(
        stream: BoxedStream<Result<WorkOutput<T>>>,
    ) -> (
        BoxedStream<Result<WorkOutput<T>>>,
        Arc<Mutex<WorkOutputCounters>>,
    ) {
        let counters = Arc::new(Mutex::new(Self::default()));
        let counters_clone = counters.clone();
        let stream = stream
            .map(move |value| {
                let value = value?;
                counters_clone.update(&value);
                Ok(value)
            })
            .boxed();
        (stream, counters)
    }
}

/// Methods on the shared `Mutex<WorkOutputCounters>`.
pub trait WorkItemCounterExt {
    /// Count one output.
    fn update<T>(&self, item: &WorkOutput<T>);

    /// Report the totals, and check the failure rate.
    fn finish(self: Arc<Self>, ui: &Ui, stream_opts: &StreamOpts) -> Result<()>;
}

impl WorkItemCounterExt for Mutex<WorkOutputCounters> {
    fn update<T>(&self, item: &WorkOutput<T>) {
        let mut counters = self.lock().expect("lock poisoned");
        counters.total_record_count += 1;
        match item.status {
            WorkStatus::Ok => counters.ok_count += 1,
            WorkStatus::Incomplete | WorkStatus::Review => counters.review_count += 1,
            WorkStatus::Rejected => counters.rejected_count += 1,
            WorkStatus::Failed => counters.failure_count += 1,
        }
        if item.status != WorkStatus::Failed {
            counters.non_fatal_error_count += item.errors.len();
        }
    }

    fn finish(self: Arc<Self>, ui: &Ui, stream_opts: &StreamOpts) -> Result<()> {
        let counters = self.lock().expect("lock poisoned").to_owned();
        ui.display_message(
            "📊",
            &format!(
                "{} processed: {} accepted, {} for review, {} rejected, {} failed",
                counters.total_record_count,
                counters.ok_count,
                counters.review_count,
                counters.rejected_count,
                counters.failure_count,
            ),
        );
        let failure_rate = if counters.total_record_count == 0 {
            0.0
        } else {
            counters.failure_count as f32 / counters.total_record_count as f32
        };
        if failure_rate > stream_opts.allowed_failure_rate {
            Err(anyhow::anyhow!(
                "{}/{} ({:.2}%) of outputs were failures, but only {:.2}% were allowed",
                counters.failure_count,
                counters.total_record_count,
                failure_rate * 100.0,
                stream_opts.allowed_failure_rate * 100.0
            ))
        } else {
            if counters.non_fatal_error_count > 0 {
                ui.display_message(
                    "⚠️",
                    &format!(
                        "{} non-fatal errors encountered",
                        counters.non_fatal_error_count
                    ),
                );
            }
            if counters.failure_count > 0 {
                ui.display_message(
                    "❌",
                    &format!("{} records could not be processed", counters.failure_count),
                );
            }
            Ok(())
        }
    }
}

/// An input plus the channel its output goes back on.
#[derive(Debug)]
pub struct WorkItem<InputData, OutputData>
where
    InputData: 'static,
    OutputData: 'static,
{
    pub input: WorkInput<InputData>,

    pub tx: oneshot::Sender<Result<WorkOutput<OutputData>>>,
}

/// Something which accepts work items.
pub trait WorkItemProcessor {
    type InputData: 'static;
    type OutputData: 'static;

    /// Hand over a work item. Its output will be sent to `item.tx`. Waits
    /// only when every slot is busy.
    async fn submit_work_item(
        &self,
        item: WorkItem<Self::InputData, Self::OutputData>,
    ) -> Result<()>;

    /// Submit an input, returning a receiver for its output.
    async fn submit_input(
        &self,
        input: WorkInput<Self::InputData>,
    ) -> Result<oneshot::Receiver<Result<WorkOutput<Self::OutputData>>>> {
        let (tx, rx) = oneshot::channel();
        let item = WorkItem { input, tx };
        self.submit_work_item(item).await?;
        Ok(rx)
    }

    /// Submit an input and wait for its output.
    async fn process_blocking(
        &self,
        input: WorkInput<Self::InputData>,
    ) -> Result<WorkOutput<Self::OutputData>> {
        let rx = self.submit_input(input).await?;
        rx.await.context("failed to receive work item result")?
    }
}

/// Turns one input record into one output record.
pub type WorkFn<InputData, OutputData> = Arc<
    dyn Fn(WorkInput<InputData>) -> BoxedFuture<Result<WorkOutput<OutputData>>>
        + Send
        + Sync
        + 'static,
>;

/// A cheaply cloneable sender for a [`WorkQueue`].
pub struct WorkQueueHandle<InputData, OutputData>
where
    InputData: 'static,
    OutputData: 'static,
{
    tx: mpsc::Sender<WorkItem<InputData, OutputData>>,
}

impl<InputData, OutputData> WorkQueueHandle<InputData, OutputData>
where
    InputData: Send + 'static,
    OutputData: Send + 'static,
{
    /// Map inputs to futures of outputs. Resolve them with
    /// [`futures::StreamExt::buffered`] to keep input order.
    pub fn process_stream(
        &self,
        input: BoxedStream<Result<WorkInput<InputData>>>,
    ) -> BoxedStream<BoxedFuture<Result<WorkOutput<OutputData>>>> {
        let handle = self.clone();
        input
            .map(move |input| {
                let handle = handle.clone();
                async move {
                    let input = input?;
                    handle.process_blocking(input).await
                }
                .boxed()
            })
            .boxed()
    }
}

// Written by hand, so the data types needn't be `Clone`.
impl<InputData, OutputData> Clone for WorkQueueHandle<InputData, OutputData> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<InputData, OutputData> WorkItemProcessor for WorkQueueHandle<InputData, OutputData>
where
    InputData: 'static,
    OutputData: 'static,
{
    type InputData = InputData;
    type OutputData = OutputData;

    async fn submit_work_item(
        &self,
        item: WorkItem<Self::InputData, Self::OutputData>,
    ) -> Result<()> {
        let mut tx = self.tx.clone();
        tx.send(item).await.context("failed to send work item")?;
        Ok(())
    }
}

/// Runs a [`WorkFn`] on submitted items, several at a time.
pub struct WorkQueue<InputData, OutputData>
where
    InputData: 'static,
    OutputData: 'static,
{
    tx: mpsc::Sender<WorkItem<InputData, OutputData>>,
}

impl<InputData, OutputData> WorkQueue<InputData, OutputData>
where
    InputData: Send + 'static,
    OutputData: Send + 'static,
{
    /// Start a queue running up to `concurrency_limit` items at once, with as
    /// many again waiting. The worker exits once every handle is dropped.
    pub fn new(
        concurrency_limit: usize,
        work_fn: WorkFn<InputData, OutputData>,
    ) -> (Self, JoinWorker) {
        let concurrency_limit = concurrency_limit.max(1);
        let (tx, rx) = mpsc::channel(concurrency_limit);
        let worker = tokio::spawn(async move {
            rx.for_each_concurrent(
                concurrency_limit,
                |item: WorkItem<InputData, OutputData>| async {
                    let result = work_fn(item.input).await;
                    if let Err(_sent_value) = item.tx.send(result) {
                        debug!(
                            "failed to send work item result because receiver was dropped"
                        );
                    }
                },
            )
            .await;
            Ok(())
        });
        (Self { tx }, JoinWorker::from_handle(worker))
    }

    /// A handle for submitting items.
    pub fn handle(&self) -> WorkQueueHandle<InputData, OutputData> {
        WorkQueueHandle {
            tx: self.tx.clone(),
        }
    }
}
