//! Per-frame read-only view of the output store.
//!
//! Built once per frame over the committed rows of the current run. The three
//! lookups differ in which iteration they read:
//!
//! - `output` / `output_maybe` are iteration-scoped: a repeating task's own
//!   recomputation within the current loop iteration.
//! - `latest` is cross-iteration: dependency reads that must survive a loop
//!   advance.
//!
//! Calling `latest` for a repeating node pins its first iteration forever;
//! an iteration-scoped call for a cross-iteration dependency returns none
//! after the first loop advance. Callers pick the lookup by intent.

use serde_json::Value;
use std::collections::HashMap;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::OutputRow;
use crate::domain::ports::OutputStore;
use crate::domain::schema::SchemaCatalog;

/// Immutable snapshot of one run's output rows at a frame boundary.
#[derive(Debug, Clone, Default)]
pub struct FrameSnapshot {
    run_id: String,
    rows: HashMap<(String, String, i64), Value>,
    latest: HashMap<(String, String), i64>,
    /// Per-schema `(node_id, iteration)` pairs in iteration-ascending order.
    ordered: HashMap<String, Vec<(String, i64)>>,
}

impl FrameSnapshot {
    /// Scan every catalog relation for the run.
    pub async fn load(
        store: &dyn OutputStore,
        catalog: &SchemaCatalog,
        run_id: &str,
    ) -> DomainResult<Self> {
        let mut snapshot = Self {
            run_id: run_id.to_string(),
            ..Default::default()
        };
        for key in catalog.keys() {
            let rows = store.scan(key, run_id).await?;
            snapshot.absorb(key, rows);
        }
        Ok(snapshot)
    }

    fn absorb(&mut self, schema_key: &str, rows: Vec<OutputRow>) {
        let ordered = self.ordered.entry(schema_key.to_string()).or_default();
        for row in rows {
            let latest_key = (schema_key.to_string(), row.node_id.clone());
            let max = self.latest.entry(latest_key).or_insert(row.iteration);
            if *max < row.iteration {
                *max = row.iteration;
            }
            ordered.push((row.node_id.clone(), row.iteration));
            self.rows.insert(
                (schema_key.to_string(), row.node_id, row.iteration),
                row.payload,
            );
        }
        ordered.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    }

    /// Insert a row directly. Test seam and post-frame refresh helper.
    pub fn insert(&mut self, schema_key: &str, node_id: &str, iteration: i64, payload: Value) {
        self.absorb(
            schema_key,
            vec![OutputRow::new(self.run_id.clone(), node_id, iteration, payload)],
        );
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Exact lookup; fails with `NotFound` when absent. Use when certainty of
    /// existence is required.
    pub fn output(&self, schema_key: &str, node_id: &str, iteration: i64) -> DomainResult<&Value> {
        self.output_maybe(schema_key, node_id, iteration)
            .ok_or_else(|| DomainError::NotFound {
                schema: schema_key.to_string(),
                node_id: node_id.to_string(),
                iteration,
            })
    }

    /// Iteration-scoped lookup returning none on absence.
    pub fn output_maybe(&self, schema_key: &str, node_id: &str, iteration: i64) -> Option<&Value> {
        self.rows
            .get(&(schema_key.to_string(), node_id.to_string(), iteration))
    }

    /// Cross-iteration lookup: the row with the maximum iteration for
    /// `(run, node)`, with that iteration.
    pub fn latest(&self, schema_key: &str, node_id: &str) -> Option<(&Value, i64)> {
        let iteration = *self
            .latest
            .get(&(schema_key.to_string(), node_id.to_string()))?;
        self.output_maybe(schema_key, node_id, iteration)
            .map(|value| (value, iteration))
    }

    /// All rows of one relation, iteration-ascending.
    pub fn scan(&self, schema_key: &str) -> Vec<(&str, i64, &Value)> {
        let Some(ordered) = self.ordered.get(schema_key) else {
            return Vec::new();
        };
        ordered
            .iter()
            .filter_map(|(node_id, iteration)| {
                self.output_maybe(schema_key, node_id, *iteration)
                    .map(|value| (node_id.as_str(), *iteration, value))
            })
            .collect()
    }
}
