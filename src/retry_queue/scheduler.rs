use chrono::Utc;
use futures::stream::{self, StreamExt};
use metrics::counter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::handlers::RetryJobHandler;
use super::repository::RetryJobRepository;
use crate::config::RetryQueueConfig;
use crate::entities::{RetryJobModel, RetryJobStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::notifications::{Notification, NotificationDispatcher};

/// Counts for one scheduler pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub recovered: u64,
    pub claimed: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub dead: usize,
    pub pruned: u64,
}

enum JobOutcome {
    Succeeded,
    Rescheduled,
    Dead,
    /// Bookkeeping itself failed; the lock is left for stale recovery
    Unrecorded,
}

/// Periodic single-flight worker over the retry queue.
pub struct RetryScheduler {
    repo: RetryJobRepository,
    handlers: HashMap<&'static str, Arc<dyn RetryJobHandler>>,
    notifications: NotificationDispatcher,
    event_sender: Arc<EventSender>,
    config: RetryQueueConfig,
    worker_id: String,
    running: AtomicBool,
}

/// Clears the in-progress flag even if a pass returns early.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetryScheduler {
    pub fn new(
        repo: RetryJobRepository,
        notifications: NotificationDispatcher,
        event_sender: Arc<EventSender>,
        config: RetryQueueConfig,
    ) -> Self {
        Self {
            repo,
            handlers: HashMap::new(),
            notifications,
            event_sender,
            config,
            worker_id: format!("retry-worker-{}", Uuid::new_v4()),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn RetryJobHandler>) -> Self {
        self.handlers.insert(handler.job_type(), handler);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Runs one pass. Returns `None` when a previous pass is still running.
    #[instrument(skip(self), fields(worker = %self.worker_id))]
    pub async fn run_once(&self) -> Option<Result<RunSummary, ServiceError>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("previous retry pass still running, skipping");
            counter!("retry_queue.runs.skipped", 1);
            return None;
        }
        let _guard = RunGuard(&self.running);
        Some(self.run_pass().await)
    }

    async fn run_pass(&self) -> Result<RunSummary, ServiceError> {
        let now = Utc::now();
        let mut summary = RunSummary {
            recovered: self.repo.recover_stale(now, self.config.lock_timeout()).await?,
            ..Default::default()
        };

        let due = self.repo.due_jobs(now, self.config.batch_size).await?;
        let mut claimed = Vec::with_capacity(due.len());
        for job in due {
            match self.repo.claim(job.id, &self.worker_id, Utc::now()).await? {
                Some(job) => claimed.push(job),
                None => debug!(dedupe_key = %job.dedupe_key, "job claimed by another worker"),
            }
        }
        summary.claimed = claimed.len();

        let outcomes: Vec<JobOutcome> = stream::iter(claimed)
            .map(|job| self.process(job))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            match outcome {
                JobOutcome::Succeeded => summary.succeeded += 1,
                JobOutcome::Rescheduled => summary.rescheduled += 1,
                JobOutcome::Dead => summary.dead += 1,
                JobOutcome::Unrecorded => {}
            }
        }

        summary.pruned = match self
            .repo
            .prune_succeeded(Utc::now() - self.config.succeeded_retention())
            .await
        {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "failed to prune succeeded retry jobs");
                0
            }
        };

        if summary.claimed > 0 || summary.recovered > 0 {
            info!(
                claimed = summary.claimed,
                succeeded = summary.succeeded,
                rescheduled = summary.rescheduled,
                dead = summary.dead,
                recovered = summary.recovered,
                "retry pass finished"
            );
        }
        Ok(summary)
    }

    async fn process(&self, job: RetryJobModel) -> JobOutcome {
        let result = match self.handlers.get(job.job_type.as_str()) {
            Some(handler) => {
                match tokio::time::timeout(self.config.job_timeout(), handler.handle(&job)).await {
                    Ok(result) => result,
                    Err(_) => Err(ServiceError::Timeout(format!("retry job {}", job.dedupe_key))),
                }
            }
            None => Err(ServiceError::InternalError(format!(
                "no handler registered for job type {}",
                job.job_type
            ))),
        };

        match result {
            Ok(()) => self.on_success(job).await,
            Err(err) => self.on_failure(job, err).await,
        }
    }

    async fn on_success(&self, job: RetryJobModel) -> JobOutcome {
        if let Err(e) = self.repo.mark_succeeded(&job).await {
            error!(dedupe_key = %job.dedupe_key, error = %e, "failed to record retry success");
            return JobOutcome::Unrecorded;
        }
        counter!("retry_queue.jobs.succeeded", 1, "job_type" => job.job_type.clone());
        info!(dedupe_key = %job.dedupe_key, "retry job succeeded");
        self.notifications.dispatch_to_operator(|to| {
            Notification::retry_succeeded(to, &job.dedupe_key, &job.job_type)
        });
        JobOutcome::Succeeded
    }

    async fn on_failure(&self, job: RetryJobModel, err: ServiceError) -> JobOutcome {
        let message = err.to_string();
        let updated = match self
            .repo
            .record_failure(&job, &message, Utc::now(), self.config.retry_delay())
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                error!(dedupe_key = %job.dedupe_key, error = %e, "failed to record retry failure");
                return JobOutcome::Unrecorded;
            }
        };

        let dead = updated.status == RetryJobStatus::Dead;
        self.notifications.dispatch_to_operator(|to| {
            Notification::retry_failed(to, &updated.dedupe_key, updated.attempts, dead, &message)
        });

        if dead {
            counter!("retry_queue.jobs.dead", 1, "job_type" => updated.job_type.clone());
            error!(
                dedupe_key = %updated.dedupe_key,
                attempts = updated.attempts,
                error = %message,
                "retry job exhausted its attempts"
            );
            self.event_sender.send_or_log(Event::RetryJobDead {
                dedupe_key: updated.dedupe_key.clone(),
                job_type: updated.job_type.clone(),
                attempts: updated.attempts,
                at: updated.updated_at,
            });
            JobOutcome::Dead
        } else {
            counter!("retry_queue.jobs.failed", 1, "job_type" => updated.job_type.clone());
            warn!(
                dedupe_key = %updated.dedupe_key,
                attempts = updated.attempts,
                next_retry_at = %updated.next_retry_at,
                error = %message,
                "retry job failed, rescheduled"
            );
            JobOutcome::Rescheduled
        }
    }

    /// Runs a pass every `interval_secs`. Ticks that fall behind are skipped.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                worker = %self.worker_id,
                interval_secs = self.config.interval_secs,
                "retry scheduler started"
            );
            loop {
                ticker.tick().await;
                if let Some(Err(e)) = self.run_once().await {
                    error!(error = %e, "retry pass failed");
                }
            }
        })
    }
}
