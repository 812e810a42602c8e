//! Schema catalog: logical column name → type → physical field name

use super::column_type::ColumnType;
use crate::error::{DgError, DgResult};
use crate::storage::asset::AssetRegistry;
use serde::{Deserialize, Serialize};

/// Synthetic first column of every grid.
pub const ROW_ID: &str = "row-id";
/// Suffix of the companion column that snapshots asset metadata.
pub const METADATA_SUFFIX: &str = "--metadata";
/// Upper bound on physical columns, `row-id` included.
pub const MAX_COLUMNS: usize = 101;
pub const MAX_COLUMN_NAME_LENGTH: usize = 50;
/// Soft limit; exceeding it only logs a warning.
pub const MAX_ROWS: usize = 1_000_000;

/// Physical identifier of the n-th field ever allocated.
pub fn field_name_for(index: usize) -> String {
    format!("column_{}", index)
}

/// Companion metadata column of an asset column.
pub fn metadata_column_name(name: &str) -> String {
    format!("{}{}", name, METADATA_SUFFIX)
}

pub fn is_metadata_column(name: &str) -> bool {
    name.ends_with(METADATA_SUFFIX)
}

/// Rejects names users may not give a column.
pub fn verify_column_name(name: &str) -> DgResult<()> {
    if name.is_empty() {
        return Err(DgError::Schema("column name cannot be empty".to_string()));
    }
    if name.chars().count() > MAX_COLUMN_NAME_LENGTH {
        return Err(DgError::Schema(format!(
            "column name '{}' is longer than {} characters",
            name, MAX_COLUMN_NAME_LENGTH
        )));
    }
    if name == ROW_ID {
        return Err(DgError::Schema(format!("column name '{}' is reserved", ROW_ID)));
    }
    if is_metadata_column(name) {
        return Err(DgError::Schema(format!(
            "column name '{}' cannot end with '{}'",
            name, METADATA_SUFFIX
        )));
    }
    Ok(())
}

/// Parses a type name, checking asset kinds against the registry.
pub fn verify_type(type_name: &str, registry: &AssetRegistry) -> DgResult<ColumnType> {
    let column_type: ColumnType = type_name.parse()?;
    if let ColumnType::Asset(kind) = &column_type {
        if !registry.contains(kind) {
            return Err(DgError::Schema(format!(
                "unknown asset type '{}'",
                type_name
            )));
        }
    }
    if column_type == ColumnType::RowId {
        return Err(DgError::Schema("ROW_ID is reserved for 'row-id'".to_string()));
    }
    Ok(column_type)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub field_name: String,
}

impl Column {
    pub fn is_row_id(&self) -> bool {
        self.column_type == ColumnType::RowId
    }

    pub fn is_metadata(&self) -> bool {
        is_metadata_column(&self.name)
    }
}

/// Ordered column catalog.
///
/// `next_field` only grows, so a dropped column's field name is never handed
/// out again.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    columns: Vec<Column>,
    next_field: usize,
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema {
    pub fn new() -> Self {
        Self {
            columns: vec![Column {
                name: ROW_ID.to_string(),
                column_type: ColumnType::RowId,
                field_name: field_name_for(0),
            }],
            next_field: 1,
        }
    }

    /// Rebuilds a schema read back from the catalog.
    pub fn from_columns(columns: Vec<Column>, next_field: usize) -> DgResult<Self> {
        match columns.first() {
            Some(first) if first.is_row_id() => {}
            _ => {
                return Err(DgError::Schema(format!(
                    "catalog does not start with '{}'",
                    ROW_ID
                )));
            }
        }
        let used = columns
            .iter()
            .filter_map(|c| c.field_name.strip_prefix("column_"))
            .filter_map(|n| n.parse::<usize>().ok())
            .max()
            .map_or(1, |n| n + 1);
        Ok(Self {
            columns,
            next_field: next_field.max(used),
        })
    }

    /// Adds a user column; asset columns also get their companion.
    pub fn add_column(&mut self, name: &str, column_type: ColumnType) -> DgResult<&Column> {
        verify_column_name(name)?;
        if column_type == ColumnType::RowId {
            return Err(DgError::Schema("ROW_ID is reserved for 'row-id'".to_string()));
        }
        if self.contains(name) {
            return Err(DgError::Schema(format!("column '{}' already exists", name)));
        }
        let needed = if column_type.is_asset() { 2 } else { 1 };
        if self.columns.len() + needed > MAX_COLUMNS {
            return Err(DgError::Schema(format!(
                "a DataGrid can hold at most {} columns",
                MAX_COLUMNS
            )));
        }

        let is_asset = column_type.is_asset();
        let index = self.push(name, column_type);
        if is_asset {
            self.push(&metadata_column_name(name), ColumnType::Json);
        }
        Ok(&self.columns[index])
    }

    fn push(&mut self, name: &str, column_type: ColumnType) -> usize {
        self.columns.push(Column {
            name: name.to_string(),
            column_type,
            field_name: field_name_for(self.next_field),
        });
        self.next_field += 1;
        self.columns.len() - 1
    }

    /// Removes a user column and its companion, returning what was removed.
    pub fn remove_column(&mut self, name: &str) -> DgResult<Vec<Column>> {
        if name == ROW_ID {
            return Err(DgError::Schema(format!("cannot remove '{}'", ROW_ID)));
        }
        if is_metadata_column(name) {
            return Err(DgError::Schema(format!(
                "'{}' is removed together with its asset column",
                name
            )));
        }
        let position = self
            .position(name)
            .ok_or_else(|| DgError::Schema(format!("no such column '{}'", name)))?;
        let mut removed = vec![self.columns.remove(position)];
        let companion = metadata_column_name(name);
        if let Some(position) = self.position(&companion) {
            removed.push(self.columns.remove(position));
        }
        Ok(removed)
    }

    /// Widens an in-memory column's type after unification.
    pub(crate) fn set_type(&mut self, name: &str, column_type: ColumnType) {
        if let Some(column) = self.columns.iter_mut().find(|c| c.name == name) {
            column.column_type = column_type;
        }
    }

    /// Adds the companion of an in-memory column that resolved to an asset
    /// type after its declaration.
    pub(crate) fn ensure_companion(&mut self, name: &str) {
        let companion = metadata_column_name(name);
        if self.contains(&companion) {
            return;
        }
        if let Some(position) = self.position(name) {
            self.columns.insert(
                position + 1,
                Column {
                    name: companion,
                    column_type: ColumnType::Json,
                    field_name: field_name_for(self.next_field),
                },
            );
            self.next_field += 1;
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn field_name(&self, name: &str) -> DgResult<&str> {
        self.get(name)
            .map(|c| c.field_name.as_str())
            .ok_or_else(|| DgError::Schema(format!("no such column '{}'", name)))
    }

    pub fn column_type(&self, name: &str) -> Option<&ColumnType> {
        self.get(name).map(|c| &c.column_type)
    }

    /// Companion metadata column of asset column `name`.
    pub fn companion_of(&self, name: &str) -> Option<&Column> {
        self.get(&metadata_column_name(name))
    }

    /// Every column, `row-id` and companions included.
    pub fn iter(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Columns a user declared.
    pub fn user_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns
            .iter()
            .filter(|c| !c.is_row_id() && !c.is_metadata())
    }

    /// Columns shown by default: `row-id` plus user columns.
    pub fn visible_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.is_metadata())
    }

    pub fn asset_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.column_type.is_asset())
    }

    pub fn names(&self) -> Vec<String> {
        self.visible_columns().map(|c| c.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.len() <= 1
    }

    pub fn next_field(&self) -> usize {
        self.next_field
    }
}
