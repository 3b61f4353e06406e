//! Configuration for a Super-Ralph run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::domain::models::AgentPool;
use crate::services::merge_queue::OrderingStrategy;

/// Environment override for the global concurrency cap.
pub const MAX_CONCURRENCY_ENV: &str = "WORKFLOW_MAX_CONCURRENCY";

const MIN_CONCURRENCY: usize = 1;
const MAX_CONCURRENCY: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
    #[error("Failed to read configuration: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Validation failed for {field}: {reason}")]
    ValidationError { field: String, reason: String },
}

fn default_main_branch() -> String {
    "main".to_string()
}

fn default_max_concurrency() -> usize {
    6
}

fn default_max_speculative_depth() -> usize {
    3
}

fn default_max_passes() -> i64 {
    8
}

fn default_vcs_bin() -> String {
    "jj".to_string()
}

fn default_database_url() -> String {
    "sqlite://.ralph/ralph.db".to_string()
}

fn default_retries() -> u32 {
    2
}

fn default_agent_timeout_secs() -> u64 {
    60 * 60
}

/// Run configuration, consumed once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub project_name: String,
    pub repo_root: PathBuf,
    pub specs_path: Option<PathBuf>,
    pub reference_files: Vec<String>,
    /// Ordered ecosystem → command maps.
    pub build_cmds: BTreeMap<String, String>,
    pub test_cmds: BTreeMap<String, String>,
    pub pre_land_checks: Vec<String>,
    pub post_land_checks: Vec<String>,
    pub code_style: String,
    pub review_checklist: Vec<String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_main_branch")]
    pub main_branch: String,
    #[serde(default = "default_max_speculative_depth")]
    pub max_speculative_depth: usize,
    pub ordering_strategy: OrderingStrategy,
    /// Ceiling for ralph loop passes.
    #[serde(default = "default_max_passes")]
    pub max_passes: i64,
    #[serde(default = "default_retries")]
    pub task_retries: u32,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    /// Agent pool: id → spec with role flags.
    pub agents: AgentPool,
    #[serde(default = "default_vcs_bin")]
    pub vcs_bin: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Workspace root; the OS temp dir when unset.
    pub tmp_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project_name: String::new(),
            repo_root: PathBuf::from("."),
            specs_path: None,
            reference_files: Vec::new(),
            build_cmds: BTreeMap::new(),
            test_cmds: BTreeMap::new(),
            pre_land_checks: Vec::new(),
            post_land_checks: Vec::new(),
            code_style: String::new(),
            review_checklist: Vec::new(),
            max_concurrency: default_max_concurrency(),
            main_branch: default_main_branch(),
            max_speculative_depth: default_max_speculative_depth(),
            ordering_strategy: OrderingStrategy::default(),
            max_passes: default_max_passes(),
            task_retries: default_retries(),
            agent_timeout_secs: default_agent_timeout_secs(),
            agents: AgentPool::new(),
            vcs_bin: default_vcs_bin(),
            database_url: default_database_url(),
            tmp_dir: None,
        }
    }
}

impl Config {
    /// Load from a TOML file and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// `WORKFLOW_MAX_CONCURRENCY`, clamped to 1..=32.
    pub fn apply_env(&mut self) {
        if let Ok(raw) = std::env::var(MAX_CONCURRENCY_ENV) {
            if let Ok(value) = raw.parse::<usize>() {
                self.max_concurrency = value.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
            }
        }
        self.max_concurrency = self.max_concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::ValidationError {
                field: "agents".to_string(),
                reason: "at least one agent must be configured".to_string(),
            });
        }
        if self.max_speculative_depth == 0 {
            return Err(ConfigError::ValidationError {
                field: "max_speculative_depth".to_string(),
                reason: "window depth must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Workspace root directory.
    pub fn tmp_root(&self) -> PathBuf {
        self.tmp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}
