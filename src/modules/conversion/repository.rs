use super::model::{JobOutcome, JobStatus, Recorded};
use crate::infrastructure::db::pool::DbPool;
use async_trait::async_trait;
use sqlx::{Postgres, Transaction};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("No task row for job '{0}'")]
    NotFound(String),

    /// The row exists and is not terminal, yet the guarded update matched nothing.
    #[error("Task row for job '{job_id}' was not updated (status '{status}')")]
    Unchanged { job_id: String, status: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable sink for job outcomes. Implementations must apply each call
/// atomically and report a missing row as an error.
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn record(&self, job_id: &str, outcome: JobOutcome) -> Result<Recorded, RecordError>;
}

/// `tasks` table access. Every call runs in its own transaction from the pool.
#[derive(Clone)]
pub struct TaskRepository {
    pool: DbPool,
}

impl TaskRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn apply(
        tx: &mut Transaction<'_, Postgres>,
        job_id: &str,
        outcome: JobOutcome,
    ) -> Result<Recorded, RecordError> {
        let result = match outcome {
            JobOutcome::Success { start, end } => {
                sqlx::query(
                    r#"
                    UPDATE tasks
                    SET status = $1, start_convert = $2, end_convert = $3
                    WHERE source_uuid = $4 AND status = $5
                    "#,
                )
                .bind(JobStatus::Available.as_str())
                .bind(start)
                .bind(end)
                .bind(job_id)
                .bind(JobStatus::Pending.as_str())
                .execute(&mut **tx)
                .await?
            }
            JobOutcome::Failure => {
                sqlx::query("UPDATE tasks SET status = $1 WHERE source_uuid = $2 AND status = $3")
                    .bind(JobStatus::Failed.as_str())
                    .bind(job_id)
                    .bind(JobStatus::Pending.as_str())
                    .execute(&mut **tx)
                    .await?
            }
        };

        if result.rows_affected() > 0 {
            return Ok(Recorded::Applied(outcome.status()));
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM tasks WHERE source_uuid = $1")
                .bind(job_id)
                .fetch_optional(&mut **tx)
                .await?;

        match current {
            None => Err(RecordError::NotFound(job_id.to_string())),
            Some(raw) => match raw.parse::<JobStatus>() {
                Ok(status) if status.is_terminal() => Ok(Recorded::AlreadyTerminal(status)),
                _ => Err(RecordError::Unchanged {
                    job_id: job_id.to_string(),
                    status: raw,
                }),
            },
        }
    }
}

#[async_trait]
impl StatusStore for TaskRepository {
    async fn record(&self, job_id: &str, outcome: JobOutcome) -> Result<Recorded, RecordError> {
        let mut tx = self.pool.begin().await?;

        match Self::apply(&mut tx, job_id, outcome).await {
            Ok(recorded) => {
                tx.commit().await?;
                debug!(job_id, ?recorded, "Task status committed");
                Ok(recorded)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(job_id, "Rollback failed after record error: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}
