//! Structural schemas for task outputs.
//!
//! A declarative schema AST decoupled from the validator: primitives, closed
//! enumerations, nullable wrappers, lists, records, and unions. Absence is
//! encoded exclusively as `null` — a missing record field is a mismatch, and
//! undeclared fields are rejected.

mod catalog;
mod validate;

pub use catalog::SchemaCatalog;
pub use validate::{validate, SchemaError};

/// A structural schema.
#[derive(Debug, Clone, PartialEq)]
pub enum Schema {
    Str,
    Int,
    Float,
    Bool,
    /// Closed enumeration of string values.
    Enum(&'static [&'static str]),
    /// `null` or the inner schema.
    Nullable(Box<Schema>),
    List(Box<Schema>),
    /// Closed record: every declared field required, no extras.
    Record(Vec<(&'static str, Schema)>),
    /// First matching alternative wins.
    Union(Vec<Schema>),
}

impl Schema {
    /// Compact JSON-ish sketch of the schema, used in prompts.
    pub fn outline(&self) -> String {
        match self {
            Schema::Str => "\"string\"".to_string(),
            Schema::Int => "integer".to_string(),
            Schema::Float => "number".to_string(),
            Schema::Bool => "boolean".to_string(),
            Schema::Enum(values) => values
                .iter()
                .map(|v| format!("\"{}\"", v))
                .collect::<Vec<_>>()
                .join(" | "),
            Schema::Nullable(inner) => format!("{} | null", inner.outline()),
            Schema::List(inner) => format!("[{}]", inner.outline()),
            Schema::Record(fields) => {
                let body: Vec<String> = fields
                    .iter()
                    .map(|(name, schema)| format!("\"{}\": {}", name, schema.outline()))
                    .collect();
                format!("{{{}}}", body.join(", "))
            }
            Schema::Union(alts) => alts
                .iter()
                .map(Schema::outline)
                .collect::<Vec<_>>()
                .join(" | "),
        }
    }

    /// Short kind name used in mismatch reports.
    pub fn kind(&self) -> String {
        match self {
            Schema::Str => "string".to_string(),
            Schema::Int => "integer".to_string(),
            Schema::Float => "number".to_string(),
            Schema::Bool => "boolean".to_string(),
            Schema::Enum(values) => format!("enum[{}]", values.join("|")),
            Schema::Nullable(inner) => format!("nullable {}", inner.kind()),
            Schema::List(_) => "list".to_string(),
            Schema::Record(_) => "record".to_string(),
            Schema::Union(alts) => {
                let kinds: Vec<String> = alts.iter().map(Schema::kind).collect();
                format!("union[{}]", kinds.join("|"))
            }
        }
    }
}

/// Shorthand constructors used by the catalog.
pub(crate) fn nullable(inner: Schema) -> Schema {
    Schema::Nullable(Box::new(inner))
}

pub(crate) fn list(inner: Schema) -> Schema {
    Schema::List(Box::new(inner))
}

pub(crate) fn record(fields: Vec<(&'static str, Schema)>) -> Schema {
    Schema::Record(fields)
}
