//! SQLite connection management and schema bootstrap.

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::schema::SchemaCatalog;

/// Database connection manager with connection pooling.
pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    /// Create a new connection pool with WAL mode enabled.
    pub async fn new(database_url: &str) -> DomainResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| {
                DomainError::StorageUnavailable(format!("Invalid database URL: {}", e))
            })?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        // An in-memory database exists per connection; pool size 1 keeps it
        // a single database.
        let max_connections = if database_url.contains("memory") { 1 } else { 10 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(|e| {
                DomainError::StorageUnavailable(format!("Failed to create pool: {}", e))
            })?;

        Ok(Self { pool })
    }

    /// Create every relation the engine needs: one output table per catalog
    /// key plus the internal `runs`, `attempts`, and `scheduled_tasks` tables.
    pub async fn bootstrap(&self, catalog: &SchemaCatalog) -> DomainResult<()> {
        for key in catalog.keys() {
            let ddl = format!(
                r#"
                CREATE TABLE IF NOT EXISTS "out_{key}" (
                    run_id TEXT NOT NULL,
                    node_id TEXT NOT NULL,
                    iteration INTEGER NOT NULL,
                    payload TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    UNIQUE(run_id, node_id, iteration)
                )
                "#,
                key = key
            );
            sqlx::query(&ddl).execute(&self.pool).await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attempts (
                run_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                iteration INTEGER NOT NULL,
                attempt INTEGER NOT NULL,
                state TEXT NOT NULL,
                started_at_ms INTEGER NOT NULL,
                UNIQUE(run_id, node_id, iteration, attempt)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scheduled_tasks (
                job_id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                ticket_id TEXT,
                focus_id TEXT,
                created_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record the current run id.
    pub async fn register_run(&self, run_id: &str) -> DomainResult<()> {
        sqlx::query("INSERT OR IGNORE INTO runs (run_id, started_at) VALUES (?, ?)")
            .bind(run_id)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_creates_relations() {
        let db = DatabaseConnection::new("sqlite::memory:")
            .await
            .expect("connect");
        db.bootstrap(&SchemaCatalog::default()).await.expect("bootstrap");

        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'out_%'",
        )
        .fetch_one(db.pool())
        .await
        .expect("query");
        assert_eq!(count.0, 18);

        db.register_run("run-1").await.expect("register");
        db.register_run("run-1").await.expect("idempotent");
        db.close().await;
    }
}
