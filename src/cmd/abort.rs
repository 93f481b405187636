//! The `abort` subcommand.

use clap::Args;

use crate::{jobs::JobStore, prelude::*, recovery::abort_job, ui::Ui};

/// Abort command line arguments.
#[derive(Debug, Args)]
pub struct AbortOpts {
    pub job_id: String,

    /// Job table written by `process`.
    #[clap(long = "state")]
    pub state_path: PathBuf,

    /// Who is aborting the job.
    #[clap(long)]
    pub operator: String,

    #[clap(long)]
    pub reason: String,
}

/// The `abort` subcommand.
#[instrument(level = "debug", skip_all, fields(job_id = %opts.job_id))]
pub async fn cmd_abort(ui: Ui, opts: &AbortOpts) -> Result<()> {
    let store = JobStore::load(&opts.state_path).await?;
    let job = abort_job(&store, &opts.job_id, &opts.operator, &opts.reason).await?;
    store.save(&opts.state_path).await?;
    ui.display_message("🛑", &format!("{} is now {}", job.id, job.status));
    Ok(())
}
