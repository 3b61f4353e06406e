//! Domain layer: models, errors, ports, and output schemas.

pub mod errors;
pub mod models;
pub mod ports;
pub mod schema;

pub use errors::{DomainError, DomainResult};
