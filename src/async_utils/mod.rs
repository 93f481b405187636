//! Asynchronous utilities for use with Tokio.
//!
//! Everything in here is domain-agnostic plumbing: boxed futures and streams,
//! background worker handles and checks for external commands.

use std::{pin::Pin, sync::LazyLock};

use futures::Stream;
use regex::Regex;
use tokio::task::JoinHandle;

use crate::prelude::*;

pub mod io;

/// A type alias for a boxed future.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A type alias for a boxed stream.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// A handle for one or more background workers. This can be awaited to wait
/// for all workers to complete normally.
pub struct JoinWorker {
    future: BoxedFuture<Result<()>>,
}

impl JoinWorker {
    /// Create a new worker handle from a [`JoinHandle`].
    pub fn from_handle(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            future: Box::pin(async move { handle.await.context("could not join task")? }),
        }
    }

    /// Wait for the worker to complete.
    pub async fn join(self) -> Result<()> {
        self.future.await
    }
}

/// Matches error chatter on standard error.
pub static DEFAULT_ERROR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(error|fatal)\b").expect("failed to compile regex")
});

/// Report any command failures, and include any error output.
///
/// Standard output and standard error are logged at `trace` and `debug`
/// level. Standard error may optionally be checked against a regex, for tools
/// which exit 0 even when they fail.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    error_regex: Option<&Regex>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(command_name, output = %stdout, "Standard output from command");
    if !stderr.trim().is_empty() {
        debug!(command_name, output = %stderr, "Standard error from command");
    }

    if output.status.success() {
        if let Some(regex) = error_regex
            && regex.is_match(&stderr)
        {
            return Err(anyhow!("{command_name} printed error output:\n{stderr}"));
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{command_name} failed with exit code {exit_code} and error output:\n{stderr}"
        ))
    } else {
        Err(anyhow!("{command_name} failed with error output:\n{stderr}"))
    }
}
