//! SQLite implementation of the active-job queue.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::domain::errors::DomainResult;
use crate::domain::models::ActiveJob;
use crate::domain::ports::JobQueue;

/// The authoritative in-flight set, backed by the `scheduled_tasks` relation.
///
/// Separate from the output store: the output log has no concept of
/// "currently running".
pub struct SqliteJobQueue {
    pool: SqlitePool,
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_from(row: &sqlx::sqlite::SqliteRow) -> ActiveJob {
        ActiveJob {
            job_id: row.get("job_id"),
            job_type: row.get("job_type"),
            agent_id: row.get("agent_id"),
            ticket_id: row.get("ticket_id"),
            focus_id: row.get("focus_id"),
            created_at_ms: row.get("created_at_ms"),
        }
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn insert_if_absent(&self, job: &ActiveJob) -> DomainResult<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO scheduled_tasks
                (job_id, job_type, agent_id, ticket_id, focus_id, created_at_ms)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.job_type)
        .bind(&job.agent_id)
        .bind(&job.ticket_id)
        .bind(&job.focus_id)
        .bind(job.created_at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> DomainResult<()> {
        sqlx::query("DELETE FROM scheduled_tasks WHERE job_id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn active(&self) -> DomainResult<Vec<ActiveJob>> {
        let rows = sqlx::query(
            "SELECT * FROM scheduled_tasks ORDER BY created_at_ms ASC, job_id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(Self::row_from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schema::SchemaCatalog;
    use crate::infrastructure::database::DatabaseConnection;

    fn job(id: &str, at: i64) -> ActiveJob {
        ActiveJob {
            job_id: id.to_string(),
            job_type: "discovery".to_string(),
            agent_id: "scout".to_string(),
            ticket_id: None,
            focus_id: None,
            created_at_ms: at,
        }
    }

    async fn queue() -> SqliteJobQueue {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        db.bootstrap(&SchemaCatalog::default()).await.unwrap();
        SqliteJobQueue::new(db.pool().clone())
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let queue = queue().await;
        queue.insert_if_absent(&job("discovery", 10)).await.unwrap();
        queue.insert_if_absent(&job("discovery", 99)).await.unwrap();

        let active = queue.active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].created_at_ms, 10);
    }

    #[tokio::test]
    async fn active_orders_by_creation_time() {
        let queue = queue().await;
        queue.insert_if_absent(&job("b", 20)).await.unwrap();
        queue.insert_if_absent(&job("a", 10)).await.unwrap();

        let ids: Vec<String> = queue
            .active()
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.job_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let queue = queue().await;
        queue.insert_if_absent(&job("a", 1)).await.unwrap();
        queue.remove("a").await.unwrap();
        queue.remove("a").await.unwrap();
        assert!(queue.active().await.unwrap().is_empty());
    }
}
