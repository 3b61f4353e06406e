//! Super-Ralph-Lite: multi-agent AI development orchestrator.

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::{DomainError, DomainResult};
pub use services::{Config, ConfigError};
