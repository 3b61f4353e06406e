//! Output rows: the durable log of task outputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One row of the output store.
///
/// `(schema_key, run_id, node_id, iteration)` is unique; re-attempts upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRow {
    pub run_id: String,
    pub node_id: String,
    pub iteration: i64,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl OutputRow {
    pub fn new(run_id: impl Into<String>, node_id: impl Into<String>, iteration: i64, payload: Value) -> Self {
        Self {
            run_id: run_id.into(),
            node_id: node_id.into(),
            iteration,
            payload,
            created_at: Utc::now(),
        }
    }
}
