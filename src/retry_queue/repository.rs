use chrono::{DateTime, Duration, Utc};
use sea_orm::{
    sea_query::Condition,
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::entities::{retry_job, RetryJob, RetryJobModel, RetryJobStatus};
use crate::errors::{is_unique_violation, ServiceError};

/// A failed side effect to hand to the background worker.
#[derive(Debug, Clone)]
pub struct NewRetryJob {
    pub dedupe_key: String,
    pub job_type: String,
    pub payload: Value,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    /// Earliest time the worker may pick the job up
    pub run_at: DateTime<Utc>,
}

/// Persistence for the retry queue. Uniqueness of `dedupe_key` is enforced by
/// the database; every write here is a single statement or a conditional update.
#[derive(Clone)]
pub struct RetryJobRepository {
    db: Arc<DatabaseConnection>,
}

impl RetryJobRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Inserts the job, or folds it into the existing row for the same key.
    ///
    /// A `succeeded` row starts over as `pending` with zero attempts. A
    /// `pending` or `processing` row keeps its schedule and only records the
    /// latest error and payload. A `dead` row is left alone; only
    /// [`requeue_dead`](Self::requeue_dead) revives it.
    #[instrument(skip(self, job), fields(dedupe_key = %job.dedupe_key))]
    pub async fn enqueue(&self, job: NewRetryJob) -> Result<RetryJobModel, ServiceError> {
        let now = Utc::now();
        let row = retry_job::ActiveModel {
            id: Set(Uuid::new_v4()),
            dedupe_key: Set(job.dedupe_key.clone()),
            job_type: Set(job.job_type.clone()),
            payload: Set(job.payload.clone()),
            status: Set(RetryJobStatus::Pending),
            attempts: Set(0),
            max_attempts: Set(job.max_attempts),
            next_retry_at: Set(job.run_at),
            locked_at: Set(None),
            locked_by: Set(None),
            last_error: Set(job.last_error.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match row.insert(&*self.db).await {
            Ok(inserted) => {
                info!(job_type = %inserted.job_type, "retry job enqueued");
                return Ok(inserted);
            }
            Err(e) if is_unique_violation(&e) => {
                debug!("retry job already exists, updating in place");
            }
            Err(e) => return Err(e.into()),
        }

        let existing = self
            .find_by_dedupe_key(&job.dedupe_key)
            .await?
            .ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "retry job {} vanished after conflict",
                    job.dedupe_key
                ))
            })?;

        let mut active: retry_job::ActiveModel = existing.clone().into();
        match existing.status {
            RetryJobStatus::Dead => {
                warn!("retry job is dead, not requeueing automatically");
                return Ok(existing);
            }
            RetryJobStatus::Succeeded => {
                active.status = Set(RetryJobStatus::Pending);
                active.attempts = Set(0);
                active.max_attempts = Set(job.max_attempts);
                active.next_retry_at = Set(job.run_at);
                active.locked_at = Set(None);
                active.locked_by = Set(None);
                active.payload = Set(job.payload);
            }
            RetryJobStatus::Pending | RetryJobStatus::Processing => {
                active.payload = Set(job.payload);
            }
        }
        active.last_error = Set(job.last_error);
        active.updated_at = Set(now);
        Ok(active.update(&*self.db).await?)
    }

    pub async fn find_by_dedupe_key(
        &self,
        dedupe_key: &str,
    ) -> Result<Option<RetryJobModel>, ServiceError> {
        Ok(RetryJob::find()
            .filter(retry_job::Column::DedupeKey.eq(dedupe_key))
            .one(&*self.db)
            .await?)
    }

    /// Pending jobs whose `next_retry_at` has passed, oldest first.
    pub async fn due_jobs(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<RetryJobModel>, ServiceError> {
        Ok(RetryJob::find()
            .filter(retry_job::Column::Status.eq(RetryJobStatus::Pending))
            .filter(retry_job::Column::NextRetryAt.lte(now))
            .order_by_asc(retry_job::Column::NextRetryAt)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    /// Moves a due job to `processing` for `worker_id`. Returns `None` when
    /// another worker claimed it first or it is no longer due.
    pub async fn claim(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<RetryJobModel>, ServiceError> {
        let result = RetryJob::update_many()
            .set(retry_job::ActiveModel {
                status: Set(RetryJobStatus::Processing),
                locked_at: Set(Some(now)),
                locked_by: Set(Some(worker_id.to_string())),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(retry_job::Column::Id.eq(job_id))
            .filter(retry_job::Column::Status.eq(RetryJobStatus::Pending))
            .filter(retry_job::Column::NextRetryAt.lte(now))
            .exec(&*self.db)
            .await?;

        if result.rows_affected == 0 {
            return Ok(None);
        }
        Ok(RetryJob::find_by_id(job_id).one(&*self.db).await?)
    }

    /// Records a successful attempt.
    pub async fn mark_succeeded(&self, job: &RetryJobModel) -> Result<RetryJobModel, ServiceError> {
        let mut active: retry_job::ActiveModel = job.clone().into();
        active.status = Set(RetryJobStatus::Succeeded);
        active.attempts = Set(job.attempts + 1);
        active.locked_at = Set(None);
        active.locked_by = Set(None);
        active.last_error = Set(None);
        active.updated_at = Set(Utc::now());
        Ok(active.update(&*self.db).await?)
    }

    /// Records a failed attempt: back to `pending` after a flat `delay`, or
    /// `dead` once the attempt budget is spent.
    pub async fn record_failure(
        &self,
        job: &RetryJobModel,
        error: &str,
        now: DateTime<Utc>,
        delay: Duration,
    ) -> Result<RetryJobModel, ServiceError> {
        let attempts = job.attempts + 1;
        let mut active: retry_job::ActiveModel = job.clone().into();
        active.attempts = Set(attempts);
        active.locked_at = Set(None);
        active.locked_by = Set(None);
        active.last_error = Set(Some(error.to_string()));
        active.updated_at = Set(now);
        if attempts >= job.max_attempts {
            active.status = Set(RetryJobStatus::Dead);
        } else {
            active.status = Set(RetryJobStatus::Pending);
            active.next_retry_at = Set(now + delay);
        }
        Ok(active.update(&*self.db).await?)
    }

    /// Returns abandoned `processing` jobs to `pending` without charging an attempt.
    pub async fn recover_stale(
        &self,
        now: DateTime<Utc>,
        lock_timeout: Duration,
    ) -> Result<u64, ServiceError> {
        let cutoff = now - lock_timeout;
        let result = RetryJob::update_many()
            .set(retry_job::ActiveModel {
                status: Set(RetryJobStatus::Pending),
                locked_at: Set(None),
                locked_by: Set(None),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(retry_job::Column::Status.eq(RetryJobStatus::Processing))
            .filter(
                Condition::any()
                    .add(retry_job::Column::LockedAt.lt(cutoff))
                    .add(retry_job::Column::LockedAt.is_null()),
            )
            .exec(&*self.db)
            .await?;
        if result.rows_affected > 0 {
            warn!(recovered = result.rows_affected, "released stale retry job locks");
        }
        Ok(result.rows_affected)
    }

    /// Deletes `succeeded` jobs last touched before `older_than`.
    pub async fn prune_succeeded(&self, older_than: DateTime<Utc>) -> Result<u64, ServiceError> {
        let result = RetryJob::delete_many()
            .filter(retry_job::Column::Status.eq(RetryJobStatus::Succeeded))
            .filter(retry_job::Column::UpdatedAt.lt(older_than))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }

    pub async fn list_dead(&self, limit: u64) -> Result<Vec<RetryJobModel>, ServiceError> {
        Ok(RetryJob::find()
            .filter(retry_job::Column::Status.eq(RetryJobStatus::Dead))
            .order_by_desc(retry_job::Column::UpdatedAt)
            .limit(limit)
            .all(&*self.db)
            .await?)
    }

    /// Manual revival of a dead job: attempts reset, due immediately.
    #[instrument(skip(self))]
    pub async fn requeue_dead(&self, dedupe_key: &str) -> Result<RetryJobModel, ServiceError> {
        let job = self
            .find_by_dedupe_key(dedupe_key)
            .await?
            .filter(|job| job.status == RetryJobStatus::Dead)
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Dead retry job {} not found", dedupe_key))
            })?;

        let now = Utc::now();
        let mut active: retry_job::ActiveModel = job.into();
        active.status = Set(RetryJobStatus::Pending);
        active.attempts = Set(0);
        active.next_retry_at = Set(now);
        active.updated_at = Set(now);
        let job = active.update(&*self.db).await?;
        info!("dead retry job requeued");
        Ok(job)
    }
}
