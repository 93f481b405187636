//! The `review` subcommand.

use clap::{Args, Subcommand};
use futures::{StreamExt as _, stream};

use crate::{
    async_utils::io::{read_json_or_toml, write_output},
    jobs::JobStore,
    prelude::*,
    review::ManualReviewQueue,
    ui::Ui,
};

/// Review command line arguments.
#[derive(Debug, Args)]
pub struct ReviewOpts {
    /// Job table written by `process`.
    #[clap(long = "state")]
    pub state_path: PathBuf,

    #[clap(subcommand)]
    pub action: ReviewAction,
}

#[derive(Debug, Subcommand)]
pub enum ReviewAction {
    /// Print pending tickets as JSONL, oldest first.
    List {
        /// Only tickets which are unassigned or assigned to this reviewer.
        #[clap(long)]
        user: Option<String>,

        #[clap(long, default_value = "50")]
        limit: usize,

        /// Output JSONL file. Defaults to standard output.
        #[clap(short = 'o', long = "out")]
        output_path: Option<PathBuf>,
    },

    /// Claim a ticket.
    Assign {
        job_id: String,

        #[clap(long)]
        reviewer: String,
    },

    /// Approve or reject a ticket.
    Complete {
        job_id: String,

        #[clap(long)]
        reviewer: String,

        #[clap(long, conflicts_with = "reject", required_unless_present = "reject")]
        approve: bool,

        #[clap(long)]
        reject: bool,

        /// JSON or TOML file with corrected field values, kept on approval.
        #[clap(long = "corrections")]
        corrections_path: Option<PathBuf>,
    },
}

impl ReviewOpts {
    pub fn using_stdout_for_output(&self) -> bool {
        matches!(&self.action, ReviewAction::List { output_path: None, .. })
    }
}

/// The `review` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_review(ui: Ui, opts: &ReviewOpts) -> Result<()> {
    let store = JobStore::load(&opts.state_path).await?;
    let queue = ManualReviewQueue::new(store.clone());
    match &opts.action {
        ReviewAction::List {
            user,
            limit,
            output_path,
        } => {
            let tickets = queue.list_pending(user.as_deref(), *limit);
            let values = tickets
                .iter()
                .map(|ticket| serde_json::to_value(ticket).context("failed to serialize ticket"))
                .collect::<Vec<_>>();
            write_output(output_path.as_deref(), stream::iter(values).boxed()).await?;
            return Ok(());
        }
        ReviewAction::Assign { job_id, reviewer } => {
            queue.assign(job_id, reviewer).await?;
            ui.display_message("🙋", &format!("{job_id} assigned to {reviewer}"));
        }
        ReviewAction::Complete {
            job_id,
            reviewer,
            approve,
            reject: _,
            corrections_path,
        } => {
            let corrections = match corrections_path {
                Some(path) => Some(read_json_or_toml::<Value>(path).await?),
                None => None,
            };
            let job = queue
                .complete_review(job_id, reviewer, corrections, *approve)
                .await?;
            ui.display_message("✅", &format!("{job_id} is now {}", job.status));
        }
    }
    store.save(&opts.state_path).await
}
