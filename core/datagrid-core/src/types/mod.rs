//! Type system: column types, cell values and the schema catalog

pub mod column_type;
pub mod schema;
pub mod value;

pub use column_type::{ColumnType, canonical_kind, unify};
pub use schema::{
    Column, MAX_COLUMNS, MAX_ROWS, METADATA_SUFFIX, ROW_ID, Schema, metadata_column_name,
    verify_column_name, verify_type,
};
pub use value::{DEFAULT_DATETIME_FORMAT, MAX_TEXT_LENGTH, Value};

/// One row: column name → value, in column order.
pub type Row = indexmap::IndexMap<String, Value>;
