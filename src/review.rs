//! The manual-review queue.
//!
//! There is no separate queue structure: a job is "in the queue" while its
//! status awaits review, and the queue order is `queued_at`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;

use crate::{
    decision::Action,
    jobs::{AuditEntry, JobStatus, JobStore, ProcessingJob, TransitionError},
    prelude::*,
};

/// A pending review, as shown to reviewers.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ReviewTicket {
    pub job_id: String,
    pub filename: Option<String>,
    pub status: JobStatus,
    pub queued_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub confidence: Option<f64>,
    pub action: Option<Action>,
    pub extracted_data: Option<Value>,

    /// Failed processing attempts.
    pub attempts: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
}

/// Lists and resolves jobs waiting for a human.
pub struct ManualReviewQueue {
    store: Arc<JobStore>,
}

impl ManualReviewQueue {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }

    /// Pending tickets, oldest first. With a `user`, only tickets which are
    /// unassigned or assigned to that user.
    pub fn list_pending(&self, user: Option<&str>, limit: usize) -> Vec<ReviewTicket> {
        let mut pending = self
            .store
            .jobs()
            .into_iter()
            .filter(|job| job.status.awaits_review())
            .filter(|job| match (user, job.assigned_to.as_deref()) {
                (Some(user), Some(assignee)) => user == assignee,
                _ => true,
            })
            .collect::<Vec<_>>();
        // Jobs without a queue time sort first; ids break ties.
        pending.sort_by(|a, b| (a.queued_at, &a.id).cmp(&(b.queued_at, &b.id)));
        pending
            .into_iter()
            .take(limit)
            .map(|job| self.ticket(job))
            .collect()
    }

    fn ticket(&self, job: ProcessingJob) -> ReviewTicket {
        ReviewTicket {
            attempts: self.store.failures(&job.id).len(),
            filename: job.filename(),
            job_id: job.id,
            status: job.status,
            queued_at: job.queued_at,
            reason: job.manual_review_reason,
            confidence: job.confidence,
            action: job.action,
            extracted_data: job.extracted_data,
            assigned_to: job.assigned_to,
        }
    }

    /// Claim a ticket.
    #[instrument(level = "debug", skip(self))]
    pub async fn assign(
        &self,
        job_id: &str,
        reviewer: &str,
    ) -> Result<ProcessingJob, TransitionError> {
        check_reviewer(reviewer)?;
        let job = self
            .store
            .transition(job_id, |snapshot| {
                awaiting_review(snapshot)?;
                let mut next = snapshot.clone();
                next.assigned_to = Some(reviewer.to_owned());
                Ok(next)
            })
            .await?;
        self.store
            .audit(AuditEntry::new(job_id, reviewer, "review_assigned", None));
        Ok(job)
    }

    /// Resolve a ticket. Approved jobs are completed, with any corrections
    /// stored; the rest are rejected.
    #[instrument(level = "debug", skip(self, corrected_data))]
    pub async fn complete_review(
        &self,
        job_id: &str,
        reviewer: &str,
        corrected_data: Option<Value>,
        approved: bool,
    ) -> Result<ProcessingJob, TransitionError> {
        check_reviewer(reviewer)?;
        let job = self
            .store
            .transition(job_id, |snapshot| {
                awaiting_review(snapshot)?;
                let status = if approved {
                    JobStatus::Completed
                } else {
                    JobStatus::Rejected
                };
                let mut next = snapshot.with_status(status);
                next.assigned_to = Some(reviewer.to_owned());
                if approved && corrected_data.is_some() {
                    next.corrected_data = corrected_data.clone();
                }
                Ok(next)
            })
            .await?;
        info!(%job_id, %reviewer, status = %job.status, "Review completed");
        let action = if approved {
            "review_approved"
        } else {
            "review_rejected"
        };
        let detail = (approved && corrected_data.is_some()).then(|| "with corrections".to_owned());
        self.store
            .audit(AuditEntry::new(job_id, reviewer, action, detail));
        Ok(job)
    }
}

fn check_reviewer(reviewer: &str) -> Result<(), TransitionError> {
    if reviewer.trim().is_empty() {
        return Err(TransitionError::Rejected(
            "a reviewer name is required".to_owned(),
        ));
    }
    Ok(())
}

fn awaiting_review(job: &ProcessingJob) -> Result<(), TransitionError> {
    if !job.status.awaits_review() {
        return Err(TransitionError::Rejected(format!(
            "job {:?} is not awaiting review (status: {})",
            job.id, job.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use serde_json::json;

    use super::*;

    /// A store with jobs waiting for review, queued in the order given.
    async fn store_with_reviews(ids: &[&str]) -> Arc<JobStore> {
        let store = JobStore::new();
        let start = Utc::now();
        for (i, id) in ids.iter().enumerate() {
            store.register(ProcessingJob::new(
                (*id).to_owned(),
                PathBuf::from(format!("inbox/{id}.pdf")),
                "application/pdf".into(),
            ));
            store
                .transition(id, |job| Ok(job.with_status(JobStatus::Processing)))
                .await
                .unwrap();
            let queued_at = start + TimeDelta::seconds(i as i64);
            store
                .transition(id, |job| {
                    let mut next = job.with_status(JobStatus::ManualReviewRequired);
                    next.queued_at = Some(queued_at);
                    next.manual_review_reason = Some("low confidence".into());
                    next.confidence = Some(0.75);
                    Ok(next)
                })
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn lists_oldest_first() {
        // Registered out of id order, to check we sort by queue time.
        let store = store_with_reviews(&["b", "c", "a"]).await;
        let queue = ManualReviewQueue::new(store);
        let ids = queue
            .list_pending(None, 10)
            .into_iter()
            .map(|t| t.job_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, ["b", "c", "a"]);

        let tickets = queue.list_pending(None, 2);
        assert_eq!(tickets.len(), 2);
        assert_eq!(tickets[0].filename.as_deref(), Some("b.pdf"));
        assert_eq!(tickets[0].reason.as_deref(), Some("low confidence"));
    }

    #[tokio::test]
    async fn assignment_filters_by_user() {
        let store = store_with_reviews(&["a", "b", "c"]).await;
        let queue = ManualReviewQueue::new(store.clone());
        queue.assign("b", "alice").await.unwrap();

        let for_bob = queue
            .list_pending(Some("bob"), 10)
            .into_iter()
            .map(|t| t.job_id)
            .collect::<Vec<_>>();
        assert_eq!(for_bob, ["a", "c"]);
        assert_eq!(queue.list_pending(Some("alice"), 10).len(), 3);
        assert_eq!(store.get("b").unwrap().status, JobStatus::ManualReviewRequired);
    }

    #[tokio::test]
    async fn approval_completes_with_corrections() {
        let store = store_with_reviews(&["a"]).await;
        let queue = ManualReviewQueue::new(store.clone());
        let corrections = json!({"gross_total": "1230.00"});
        let job = queue
            .complete_review("a", "alice", Some(corrections.clone()), true)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.corrected_data, Some(corrections));
        assert!(queue.list_pending(None, 10).is_empty());

        let entry = store.audit_log("a").pop().unwrap();
        assert_eq!(entry.actor, "alice");
        assert_eq!(entry.action, "review_approved");

        // Once resolved, it stays resolved.
        let err = queue
            .complete_review("a", "bob", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::Rejected(_)));
    }

    #[tokio::test]
    async fn rejection_discards_corrections() {
        let store = store_with_reviews(&["a"]).await;
        let queue = ManualReviewQueue::new(store.clone());
        let job = queue
            .complete_review("a", "alice", Some(json!({"x": 1})), false)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Rejected);
        assert_eq!(job.corrected_data, None);
        assert_eq!(store.audit_log("a").pop().unwrap().action, "review_rejected");
    }

    #[tokio::test]
    async fn only_pending_jobs_can_be_reviewed() {
        let store = JobStore::new();
        store.register(ProcessingJob::new(
            "queued".into(),
            PathBuf::from("queued.pdf"),
            "application/pdf".into(),
        ));
        let queue = ManualReviewQueue::new(store);
        let err = queue
            .complete_review("queued", "alice", None, true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not awaiting review"), "{err}");
        assert!(matches!(
            queue.assign("nope", "alice").await.unwrap_err(),
            TransitionError::NotFound(_)
        ));
        assert!(matches!(
            queue.assign("queued", " ").await.unwrap_err(),
            TransitionError::Rejected(_)
        ));
    }
}
