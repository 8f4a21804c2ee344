//! Tool schemas advertised by servers and argument validation.

pub mod schema;
pub mod validation;

pub use schema::{SchemaBuilder, ToolAnnotations, ToolCatalog, ToolSchema};
pub use validation::validate_arguments;
