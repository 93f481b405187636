//! The `process` subcommand.

use std::sync::Arc;

use clap::Args;
use futures::StreamExt as _;

use crate::{
    async_utils::io::count_jsonl_or_csv_records,
    config::Config,
    decision::{DecisionEngine, DecisionStrategy},
    ensemble::EnsembleController,
    jobs::JobStore,
    monitor::EngineMonitor,
    prelude::*,
    preprocess::preprocessor_for_config,
    queues::{
        documents::{DocumentInput, DocumentOutput, DocumentStreamInfo, process_documents},
        work::{WorkInput, WorkOutput},
    },
    recovery::{FallbackManager, scheduler::RetryScheduler},
    ui::{ProgressConfig, Ui},
};

use super::StreamOpts;

/// Process command line arguments.
#[derive(Debug, Args)]
pub struct ProcessOpts {
    /// Input JSONL or CSV file with `id`, `path` and optional `mime_type`
    /// fields. Defaults to standard input.
    pub input_path: Option<PathBuf>,

    /// Pipeline configuration (TOML or JSON).
    #[clap(short = 'c', long = "config")]
    pub config_path: PathBuf,

    /// Output JSONL file. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Override the configured decision strategy.
    #[clap(long, value_enum)]
    pub strategy: Option<DecisionStrategy>,

    /// Job table to resume from and save to. Review and abort commands work
    /// on this file.
    #[clap(long = "state")]
    pub state_path: Option<PathBuf>,

    #[clap(flatten)]
    pub stream_opts: StreamOpts,
}

/// The `process` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_process(ui: Ui, opts: &ProcessOpts) -> Result<()> {
    let config = Config::load(&opts.config_path).await?;
    let strategy = opts.strategy.unwrap_or(config.decision.strategy);

    let store = match &opts.state_path {
        Some(path) => JobStore::load(path).await?,
        None => JobStore::new(),
    };
    let monitor = Arc::new(EngineMonitor::new(&config.monitor));
    let ensemble = Arc::new(EnsembleController::from_config(&config, monitor)?);
    info!(%strategy, engines = ?ensemble.engine_names(), "Starting");
    let (scheduler, scheduler_worker) = RetryScheduler::start();
    let manager = Arc::new(
        FallbackManager::new(
            store.clone(),
            ensemble,
            preprocessor_for_config(&config.preprocessing),
            DecisionEngine::new(&config.decision, strategy),
            config.recovery.clone(),
            scheduler,
        )
        .with_initial_preset(config.preprocessing.initial_preset),
    );

    // Open up our input stream and parse into records.
    let input_path = opts.input_path.as_deref();
    let count = opts
        .stream_opts
        .limit_count(count_jsonl_or_csv_records(input_path).await?);
    let input = opts
        .stream_opts
        .apply_stream_input_opts(WorkInput::<DocumentInput>::read_stream(input_path).await?);

    let pb = ui.new_progress(
        &ProgressConfig {
            emoji: "🧾",
            msg: "Processing invoices",
            done_msg: "Processed invoices",
        },
        count,
    );

    let job_count = opts.stream_opts.job_count;
    let DocumentStreamInfo { stream, worker } =
        process_documents(input, job_count, manager, config.confidence.buckets.clone());
    let output = pb.wrap_stream(stream.buffered(job_count)).boxed();
    let written = WorkOutput::<DocumentOutput>::write_stream(
        &ui,
        opts.output_path.as_deref(),
        output,
        &opts.stream_opts,
    )
    .await;

    worker.join().await?;
    scheduler_worker.join().await?;

    // Save even when too many documents failed, so they can be reviewed.
    if let Some(path) = &opts.state_path {
        store.save(path).await?;
        debug!(path = %path.display(), "Saved job table");
    }
    written
}
