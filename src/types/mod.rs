//! Type mapping between Arrow physical types and SQL types.

mod mapping;
mod schema;

pub use mapping::{format_decimal, SqlType, TypeMapper, TypedValue};
pub use schema::{columns_from_schema, ColumnMetadata};
