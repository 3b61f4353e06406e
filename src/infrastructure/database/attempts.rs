//! Attempt log: durable record of in-progress task attempts.
//!
//! Supports stale-attempt recovery: on engine start, attempts still marked
//! running past the threshold are cancelled so their nodes revert to pending.

use chrono::Utc;
use sqlx::SqlitePool;
use std::time::Duration;

use crate::domain::errors::DomainResult;

const RUNNING: &str = "running";
const FINISHED: &str = "finished";
const FAILED: &str = "failed";
const CANCELLED: &str = "cancelled";

pub struct AttemptLog {
    pool: SqlitePool,
}

impl AttemptLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn start(
        &self,
        run_id: &str,
        node_id: &str,
        iteration: i64,
        attempt: i64,
    ) -> DomainResult<()> {
        sqlx::query(
            r#"
            INSERT INTO attempts (run_id, node_id, iteration, attempt, state, started_at_ms)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(run_id, node_id, iteration, attempt)
            DO UPDATE SET state = excluded.state, started_at_ms = excluded.started_at_ms
            "#,
        )
        .bind(run_id)
        .bind(node_id)
        .bind(iteration)
        .bind(attempt)
        .bind(RUNNING)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_with(
        &self,
        run_id: &str,
        node_id: &str,
        iteration: i64,
        state: &str,
    ) -> DomainResult<()> {
        sqlx::query(
            r#"
            UPDATE attempts SET state = ?
            WHERE run_id = ? AND node_id = ? AND iteration = ? AND state = ?
            "#,
        )
        .bind(state)
        .bind(run_id)
        .bind(node_id)
        .bind(iteration)
        .bind(RUNNING)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn finish(&self, run_id: &str, node_id: &str, iteration: i64) -> DomainResult<()> {
        self.finish_with(run_id, node_id, iteration, FINISHED).await
    }

    pub async fn fail(&self, run_id: &str, node_id: &str, iteration: i64) -> DomainResult<()> {
        self.finish_with(run_id, node_id, iteration, FAILED).await
    }

    pub async fn cancel(&self, run_id: &str, node_id: &str, iteration: i64) -> DomainResult<()> {
        self.finish_with(run_id, node_id, iteration, CANCELLED).await
    }

    /// Mark running attempts older than the threshold as cancelled.
    /// Returns the number of attempts recovered.
    pub async fn recover_stale(&self, older_than: Duration) -> DomainResult<u64> {
        let cutoff = Utc::now().timestamp_millis() - older_than.as_millis() as i64;
        let result = sqlx::query(
            "UPDATE attempts SET state = ? WHERE state = ? AND started_at_ms < ?",
        )
        .bind(CANCELLED)
        .bind(RUNNING)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
