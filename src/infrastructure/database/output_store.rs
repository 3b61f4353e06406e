//! SQLite implementation of the output store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::OutputRow;
use crate::domain::ports::OutputStore;
use crate::domain::schema::{validate, SchemaCatalog};

/// Append-with-upsert log, one relation per schema key.
pub struct SqliteOutputStore {
    pool: SqlitePool,
    catalog: Arc<SchemaCatalog>,
}

impl SqliteOutputStore {
    pub fn new(pool: SqlitePool, catalog: Arc<SchemaCatalog>) -> Self {
        Self { pool, catalog }
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    fn table(&self, schema_key: &str) -> DomainResult<String> {
        // Table names are derived from catalog keys only, never from input.
        if !self.catalog.contains(schema_key) {
            return Err(DomainError::UnknownSchema(schema_key.to_string()));
        }
        Ok(format!("out_{}", schema_key))
    }

    fn row_from(&self, row: &sqlx::sqlite::SqliteRow) -> DomainResult<OutputRow> {
        let payload: String = row.get("payload");
        let created_at: String = row.get("created_at");
        Ok(OutputRow {
            run_id: row.get("run_id"),
            node_id: row.get("node_id"),
            iteration: row.get("iteration"),
            payload: serde_json::from_str(&payload)?,
            created_at: created_at
                .parse::<DateTime<Utc>>()
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

#[async_trait]
impl OutputStore for SqliteOutputStore {
    async fn put(&self, schema_key: &str, row: &OutputRow) -> DomainResult<()> {
        let schema = self.catalog.get(schema_key)?;
        validate(schema, &row.payload)?;

        let table = self.table(schema_key)?;
        let sql = format!(
            r#"
            INSERT INTO "{table}" (run_id, node_id, iteration, payload, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(run_id, node_id, iteration)
            DO UPDATE SET payload = excluded.payload, created_at = excluded.created_at
            "#,
        );
        sqlx::query(&sql)
            .bind(&row.run_id)
            .bind(&row.node_id)
            .bind(row.iteration)
            .bind(serde_json::to_string(&row.payload)?)
            .bind(row.created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_exact(
        &self,
        schema_key: &str,
        run_id: &str,
        node_id: &str,
        iteration: i64,
    ) -> DomainResult<Option<OutputRow>> {
        let table = self.table(schema_key)?;
        let sql = format!(
            r#"SELECT * FROM "{table}" WHERE run_id = ? AND node_id = ? AND iteration = ?"#,
        );
        let row = sqlx::query(&sql)
            .bind(run_id)
            .bind(node_id)
            .bind(iteration)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| self.row_from(&r)).transpose()
    }

    async fn get_latest(
        &self,
        schema_key: &str,
        run_id: &str,
        node_id: &str,
    ) -> DomainResult<Option<OutputRow>> {
        let table = self.table(schema_key)?;
        let sql = format!(
            r#"
            SELECT * FROM "{table}" WHERE run_id = ? AND node_id = ?
            ORDER BY iteration DESC LIMIT 1
            "#,
        );
        let row = sqlx::query(&sql)
            .bind(run_id)
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| self.row_from(&r)).transpose()
    }

    async fn scan(&self, schema_key: &str, run_id: &str) -> DomainResult<Vec<OutputRow>> {
        let table = self.table(schema_key)?;
        let sql = format!(
            r#"SELECT * FROM "{table}" WHERE run_id = ? ORDER BY iteration ASC, node_id ASC"#,
        );
        let rows = sqlx::query(&sql)
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| self.row_from(r)).collect()
    }

    async fn scan_all_runs(&self, schema_key: &str) -> DomainResult<Vec<OutputRow>> {
        let table = self.table(schema_key)?;
        let sql = format!(
            r#"SELECT * FROM "{table}" ORDER BY run_id ASC, iteration ASC, node_id ASC"#,
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(|r| self.row_from(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::DatabaseConnection;
    use serde_json::json;

    async fn store() -> SqliteOutputStore {
        let db = DatabaseConnection::new("sqlite::memory:").await.unwrap();
        let catalog = Arc::new(SchemaCatalog::default());
        db.bootstrap(&catalog).await.unwrap();
        SqliteOutputStore::new(db.pool().clone(), catalog)
    }

    fn build_verify_row(iteration: i64, success: bool) -> OutputRow {
        OutputRow::new(
            "run-1",
            "T-1:build-verify",
            iteration,
            json!({"ticketId": "T-1", "success": success, "output": null}),
        )
    }

    #[tokio::test]
    async fn put_rejects_schema_mismatch() {
        let store = store().await;
        let row = OutputRow::new("run-1", "T-1:build-verify", 0, json!({"success": true}));
        let err = store.put("build_verify", &row).await.unwrap_err();
        assert!(matches!(err, DomainError::SchemaMismatch { .. }));
    }

    #[tokio::test]
    async fn put_rejects_unknown_schema() {
        let store = store().await;
        let row = OutputRow::new("run-1", "n", 0, json!({}));
        assert!(matches!(
            store.put("nope", &row).await.unwrap_err(),
            DomainError::UnknownSchema(_)
        ));
    }

    #[tokio::test]
    async fn upsert_on_conflict_keeps_one_row() {
        let store = store().await;
        store.put("build_verify", &build_verify_row(0, false)).await.unwrap();
        store.put("build_verify", &build_verify_row(0, true)).await.unwrap();

        let rows = store.scan("build_verify", "run-1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload["success"], json!(true));
    }

    #[tokio::test]
    async fn latest_returns_max_iteration() {
        let store = store().await;
        for i in 0..3 {
            store.put("build_verify", &build_verify_row(i, i == 2)).await.unwrap();
        }

        let latest = store
            .get_latest("build_verify", "run-1", "T-1:build-verify")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.iteration, 2);

        let exact = store
            .get_exact("build_verify", "run-1", "T-1:build-verify", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exact.iteration, 1);

        assert!(store
            .get_exact("build_verify", "run-1", "T-1:build-verify", 5)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn scan_all_runs_sees_other_runs() {
        let store = store().await;
        store.put("build_verify", &build_verify_row(0, true)).await.unwrap();
        let mut other = build_verify_row(0, true);
        other.run_id = "run-2".to_string();
        store.put("build_verify", &other).await.unwrap();

        assert_eq!(store.scan("build_verify", "run-1").await.unwrap().len(), 1);
        assert_eq!(store.scan_all_runs("build_verify").await.unwrap().len(), 2);
    }
}
