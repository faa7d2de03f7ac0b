//! In-process job queue connecting the stage workers.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{PipelineStep, RunStatus};

/// Which stage a job drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Validate the config and enter discovery.
    Start,
    Discover,
    Enrich,
    Migrate,
}

impl JobKind {
    /// Job that resumes a run sitting in `status`.
    pub fn for_status(status: RunStatus) -> Option<JobKind> {
        match status {
            RunStatus::Pending => Some(JobKind::Start),
            RunStatus::Discovering => Some(JobKind::Discover),
            RunStatus::Enriching => Some(JobKind::Enrich),
            RunStatus::Migrating => Some(JobKind::Migrate),
            _ => None,
        }
    }

    pub fn step(&self) -> PipelineStep {
        match self {
            JobKind::Start => PipelineStep::Start,
            JobKind::Discover => PipelineStep::Discovery,
            JobKind::Enrich => PipelineStep::Enrichment,
            JobKind::Migrate => PipelineStep::Migration,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.step().as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageJob {
    pub run_id: Uuid,
    pub kind: JobKind,
    /// 1-based attempt counter for transient job failures.
    pub attempt: u32,
}

impl StageJob {
    pub fn new(run_id: Uuid, kind: JobKind) -> Self {
        Self {
            run_id,
            kind,
            attempt: 1,
        }
    }

    pub fn retry(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..*self
        }
    }
}

/// Sending half of the queue. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::UnboundedSender<StageJob>,
}

pub type JobReceiver = mpsc::UnboundedReceiver<StageJob>;

impl JobQueue {
    pub fn new() -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn enqueue(&self, job: StageJob) -> Result<(), AppError> {
        tracing::debug!(run_id = %job.run_id, kind = %job.kind, attempt = job.attempt, "Enqueued job");
        self.sender
            .send(job)
            .map_err(|_| AppError::InternalError("job queue is closed".to_string()))
    }

    /// Enqueues `job` once `delay` has elapsed.
    pub fn enqueue_after(&self, job: StageJob, delay: Duration) -> Result<(), AppError> {
        if delay.is_zero() {
            return self.enqueue(job);
        }
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(job).is_err() {
                tracing::warn!(run_id = %job.run_id, "Job queue closed before delayed job was sent");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_for_status() {
        assert_eq!(JobKind::for_status(RunStatus::Pending), Some(JobKind::Start));
        assert_eq!(
            JobKind::for_status(RunStatus::Migrating),
            Some(JobKind::Migrate)
        );
        assert_eq!(JobKind::for_status(RunStatus::Partial), None);
    }

    #[tokio::test]
    async fn test_delayed_enqueue_arrives() {
        let (queue, mut receiver) = JobQueue::new();
        let job = StageJob::new(Uuid::new_v4(), JobKind::Enrich);
        queue
            .enqueue_after(job.retry(), Duration::from_millis(10))
            .unwrap();
        let received = receiver.recv().await.unwrap();
        assert_eq!(received.kind, JobKind::Enrich);
        assert_eq!(received.attempt, 2);
    }
}
