//! Delayed retries.
//!
//! One background task owns a min-heap of pending wake-ups. It sleeps until
//! the earliest one is due, or until a new one arrives, then fires every due
//! entry's oneshot channel.

use std::{cmp::Reverse, collections::BinaryHeap, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};

use crate::{async_utils::JoinWorker, prelude::*};

/// A pending wake-up. Ordered by due time, then by submission order.
struct Entry {
    due: Instant,
    seq: u64,
    job_id: String,
    notify: oneshot::Sender<()>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        (self.due, self.seq) == (other.due, other.seq)
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

/// Handle for scheduling retries. Cheap to clone.
#[derive(Clone)]
pub struct RetryScheduler {
    sender: mpsc::UnboundedSender<(Duration, String, oneshot::Sender<()>)>,
}

impl RetryScheduler {
    /// Start the scheduler. The worker exits once every handle is dropped and
    /// all pending entries have fired.
    pub fn start() -> (Self, JoinWorker) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_scheduler(receiver));
        (Self { sender }, JoinWorker::from_handle(handle))
    }

    /// Wait until `delay` has passed, as measured by the scheduler.
    #[instrument(level = "debug", skip(self))]
    pub async fn wait(&self, job_id: &str, delay: Duration) -> Result<()> {
        let (notify, fired) = oneshot::channel();
        self.sender
            .send((delay, job_id.to_owned(), notify))
            .map_err(|_| anyhow!("retry scheduler has stopped"))?;
        fired
            .await
            .map_err(|_| anyhow!("retry scheduler dropped the retry for {job_id}"))
    }
}

async fn run_scheduler(
    mut receiver: mpsc::UnboundedReceiver<(Duration, String, oneshot::Sender<()>)>,
) -> Result<()> {
    let mut pending = BinaryHeap::<Reverse<Entry>>::new();
    let mut seq = 0u64;
    let mut open = true;
    loop {
        if !open && pending.is_empty() {
            break;
        }
        let next_due = pending.peek().map(|Reverse(entry)| entry.due);
        tokio::select! {
            submitted = receiver.recv(), if open => match submitted {
                Some((delay, job_id, notify)) => {
                    trace!(%job_id, ?delay, "Retry scheduled");
                    pending.push(Reverse(Entry {
                        due: Instant::now() + delay,
                        seq,
                        job_id,
                        notify,
                    }));
                    seq += 1;
                }
                None => open = false,
            },
            _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                let now = Instant::now();
                while pending.peek().is_some_and(|Reverse(entry)| entry.due <= now) {
                    if let Some(Reverse(entry)) = pending.pop() {
                        trace!(job_id = %entry.job_id, "Retry due");
                        // The waiter may have gone away.
                        let _ = entry.notify.send(());
                    }
                }
            }
        }
    }
    debug!("Retry scheduler finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_in_due_order() {
        let (scheduler, worker) = RetryScheduler::start();
        let fired = Arc::new(Mutex::new(vec![]));
        let mut waiters = vec![];
        for (job_id, secs) in [("slow", 60), ("fast", 5), ("medium", 30)] {
            let scheduler = scheduler.clone();
            let fired = fired.clone();
            waiters.push(tokio::spawn(async move {
                scheduler
                    .wait(job_id, Duration::from_secs(secs))
                    .await
                    .unwrap();
                fired.lock().unwrap().push(job_id);
            }));
        }
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(*fired.lock().unwrap(), vec!["fast", "medium", "slow"]);

        drop(scheduler);
        worker.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn waits_for_the_delay() {
        let (scheduler, _worker) = RetryScheduler::start();
        let started = Instant::now();
        scheduler
            .wait("doc-1", Duration::from_secs(45))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(45));
    }

    #[tokio::test]
    async fn zero_delay_fires_immediately() {
        let (scheduler, _worker) = RetryScheduler::start();
        tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.wait("doc-1", Duration::ZERO),
        )
        .await
        .unwrap()
        .unwrap();
    }
}
