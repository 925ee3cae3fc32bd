//! Background task dispatch.
//!
//! Backfill and invalidation run outside the request that triggered them.
//! Handlers must tolerate redelivery; the worker retries transient failures
//! with doubling backoff and reports exhaustion to the operator log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::TaskConfig;
use crate::error::VerificationError;
use crate::signals::EntryUpdated;
use crate::verification::{
    BackfillSummary, EntryUpdateInvalidator, InvalidationOutcome, VerifierBackfill,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerificationTask {
    BackfillVerifier { verifier_id: i64, logbook_id: i64 },
    InvalidateEntry(EntryUpdated),
}

impl VerificationTask {
    pub fn describe(&self) -> String {
        match self {
            VerificationTask::BackfillVerifier {
                verifier_id,
                logbook_id,
            } => format!("backfill(verifier={}, logbook={})", verifier_id, logbook_id),
            VerificationTask::InvalidateEntry(signal) => format!(
                "invalidate(entry={}, editor={})",
                signal.entry_id, signal.editor.user_id
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub task: VerificationTask,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Backfill(BackfillSummary),
    Invalidation(InvalidationOutcome),
}

/// Sending half of the task channel; cheap to clone into request handlers
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<TaskEnvelope>,
}

impl TaskQueue {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TaskEnvelope>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Enqueue without waiting for the task to run
    pub fn dispatch(&self, task: VerificationTask) -> Result<Uuid, VerificationError> {
        let envelope = TaskEnvelope {
            id: Uuid::new_v4(),
            task,
            enqueued_at: Utc::now(),
        };
        let id = envelope.id;
        let description = envelope.task.describe();

        self.sender.send(envelope).map_err(|_| {
            VerificationError::TransientFailure(format!(
                "Task queue closed; dropped {}",
                description
            ))
        })?;

        info!("Dispatched task {} {}", id, description);
        Ok(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TaskConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &TaskConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
        }
    }

    /// Delay after the given (1-based) failed attempt
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget
    /// is spent. The last error is returned.
    pub async fn run<F, Fut, T>(&self, label: &str, mut op: F) -> Result<T, VerificationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, VerificationError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        label, attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Clone)]
pub struct TaskWorker {
    backfill: VerifierBackfill,
    invalidator: EntryUpdateInvalidator,
    policy: RetryPolicy,
}

impl TaskWorker {
    pub fn new(
        backfill: VerifierBackfill,
        invalidator: EntryUpdateInvalidator,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            backfill,
            invalidator,
            policy,
        }
    }

    /// Run one task under the retry policy
    pub async fn execute(&self, task: &VerificationTask) -> Result<TaskOutcome, VerificationError> {
        let label = task.describe();
        match task {
            VerificationTask::BackfillVerifier {
                verifier_id,
                logbook_id,
            } => self
                .policy
                .run(&label, || self.backfill.run(*verifier_id, *logbook_id))
                .await
                .map(TaskOutcome::Backfill),
            VerificationTask::InvalidateEntry(signal) => self
                .policy
                .run(&label, || self.invalidator.run(signal))
                .await
                .map(TaskOutcome::Invalidation),
        }
    }

    /// Execute a dequeued task. Failures end here: the triggering request
    /// has already completed, so the operator log is the only channel.
    pub async fn process(&self, envelope: TaskEnvelope) -> Option<TaskOutcome> {
        match self.execute(&envelope.task).await {
            Ok(outcome) => Some(outcome),
            Err(e) if e.is_transient() => {
                error!(
                    "Task {} {} exhausted {} attempts: {}",
                    envelope.id,
                    envelope.task.describe(),
                    self.policy.max_attempts,
                    e
                );
                None
            }
            Err(e) => {
                error!(
                    "Task {} {} failed permanently: {}",
                    envelope.id,
                    envelope.task.describe(),
                    e
                );
                None
            }
        }
    }

    /// Drain the queue, running each task concurrently, until every sender
    /// is dropped.
    pub async fn run(self, mut receiver: mpsc::UnboundedReceiver<TaskEnvelope>) {
        while let Some(envelope) = receiver.recv().await {
            let worker = self.clone();
            tokio::spawn(async move {
                worker.process(envelope).await;
            });
        }
        info!("Task queue closed, worker stopping");
    }

    pub fn spawn(self, receiver: mpsc::UnboundedReceiver<TaskEnvelope>) -> JoinHandle<()> {
        tokio::spawn(self.run(receiver))
    }
}
