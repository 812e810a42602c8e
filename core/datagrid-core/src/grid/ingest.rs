//! Appending rows: validation, heuristics and type inference
//!
//! A batch is staged against a copy of the schema first. Nothing is applied
//! unless every value of every row is accepted.

use super::{DataGrid, MemoryRows, Storage, persist};
use crate::error::{DgError, DgResult};
use crate::stats;
use crate::storage::sqlite;
use crate::types::{ColumnType, MAX_ROWS, ROW_ID, Row, Schema, Value, unify};
use ahash::AHashSet;
use tracing::{debug, instrument, warn};

impl DataGrid {
    pub fn append_row(&mut self, row: Row) -> DgResult<()> {
        self.extend(vec![row])
    }

    /// Rows given as positional values in visible column order, `row-id`
    /// excluded.
    pub fn extend_values(&mut self, rows: Vec<Vec<Value>>) -> DgResult<()> {
        let names: Vec<String> = self.schema.user_columns().map(|c| c.name.clone()).collect();
        let mut keyed = Vec::with_capacity(rows.len());
        for values in rows {
            if values.len() != names.len() {
                return Err(DgError::InvalidArguments(format!(
                    "expected {} values per row, got {}",
                    names.len(),
                    values.len()
                )));
            }
            keyed.push(names.iter().cloned().zip(values).collect());
        }
        self.extend(keyed)
    }

    /// Appends a batch of rows atomically.
    #[instrument(skip_all, fields(grid = %self.name, rows = rows.len()))]
    pub fn extend(&mut self, rows: Vec<Row>) -> DgResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let total = match &mut self.storage {
            Storage::InMemory(memory) => {
                let staged = stage_in_memory(
                    &self.schema,
                    memory,
                    rows,
                    &self.settings.datetime_format,
                    self.settings.heuristics,
                )?;
                self.schema = staged.schema;
                memory.unresolved = staged.unresolved;
                memory.rows.extend(staged.rows);
                memory.rows.len()
            }
            Storage::OnDisk { path } => {
                let staged = stage_on_disk(
                    &self.schema,
                    rows,
                    &self.settings.datetime_format,
                    self.settings.heuristics,
                )?;
                let mut conn = sqlite::open(&*path)?;
                let tx = conn.transaction()?;
                let mut next_id = persist::max_row_id(&tx)? + 1;
                let mut writer =
                    persist::RowWriter::new(&tx, &self.schema, &self.context, &self.settings)?;
                for row in &staged {
                    writer.insert(&tx, next_id, row)?;
                    next_id += 1;
                }
                stats::invalidate(&tx)?;
                tx.commit()?;
                debug!(assets = writer.inserted(), "batch written");
                next_id as usize - 1
            }
        };
        if total > MAX_ROWS {
            warn!(rows = total, limit = MAX_ROWS, "grid exceeds the recommended row count");
        }
        Ok(())
    }
}

fn prepare(value: Value, datetime_format: &str, heuristics: bool) -> Value {
    match value {
        Value::Text(text) if heuristics => Value::parse_heuristic(&text, datetime_format),
        other => other,
    }
}

fn check_key(schema: &Schema, key: &str) -> DgResult<()> {
    if key == ROW_ID {
        return Err(DgError::Schema(format!("'{}' is assigned automatically", ROW_ID)));
    }
    if schema.get(key).is_some_and(|c| c.is_metadata()) {
        return Err(DgError::Schema(format!(
            "'{}' is filled from the asset metadata",
            key
        )));
    }
    Ok(())
}

/// Asset columns hold exactly one kind and nothing else.
fn check_asset_compatibility(column: &str, current: &ColumnType, value: &Value) -> DgResult<()> {
    let incoming = value.infer_type();
    let mismatch = match incoming.as_ref() {
        Some(t) => (current.is_asset() || t.is_asset()) && t != current,
        None => false,
    };
    if mismatch {
        return Err(DgError::TypeMismatch {
            column: column.to_string(),
            value: value.to_text(),
            expected: current.to_string(),
        });
    }
    Ok(())
}

pub(crate) struct Staged {
    pub(crate) schema: Schema,
    pub(crate) unresolved: AHashSet<String>,
    pub(crate) rows: Vec<Row>,
}

/// Validates a batch for an in-memory grid: unknown keys add columns,
/// undeclared columns widen along the type lattice.
pub(crate) fn stage_in_memory(
    schema: &Schema,
    memory: &MemoryRows,
    rows: Vec<Row>,
    datetime_format: &str,
    heuristics: bool,
) -> DgResult<Staged> {
    let mut schema = schema.clone();
    let mut unresolved = memory.unresolved.clone();
    let mut staged = Vec::with_capacity(rows.len());
    let first_id = memory.rows.len() as i64 + 1;

    for (offset, row) in rows.into_iter().enumerate() {
        let mut out = Row::new();
        out.insert(ROW_ID.to_string(), Value::Integer(first_id + offset as i64));
        for (key, value) in row {
            check_key(&schema, &key)?;
            let value = prepare(value, datetime_format, heuristics);

            let Some(current) = schema.column_type(&key).cloned() else {
                match value.infer_type() {
                    Some(column_type) => {
                        schema.add_column(&key, column_type)?;
                    }
                    None => {
                        schema.add_column(&key, ColumnType::Text)?;
                        unresolved.insert(key.clone());
                    }
                }
                let converted = value.convert_to(
                    schema.column_type(&key).unwrap_or(&ColumnType::Text),
                    &key,
                )?;
                out.insert(key, converted);
                continue;
            };

            if memory.declared.contains(&key) {
                let converted = value.convert_to(&current, &key)?;
                out.insert(key, converted);
                continue;
            }
            let Some(incoming) = value.infer_type() else {
                out.insert(key, Value::Null);
                continue;
            };
            if unresolved.remove(&key) {
                schema.set_type(&key, incoming.clone());
                if incoming.is_asset() {
                    schema.ensure_companion(&key);
                }
                out.insert(key, value);
                continue;
            }
            check_asset_compatibility(&key, &current, &value)?;
            let unified = unify(Some(&current), Some(&incoming)).unwrap_or(incoming);
            if unified != current {
                schema.set_type(&key, unified.clone());
            }
            let converted = value.convert_to(&unified, &key)?;
            out.insert(key, converted);
        }
        staged.push(out);
    }
    Ok(Staged {
        schema,
        unresolved,
        rows: staged,
    })
}

/// Validates a batch against a frozen schema; every value converts to its
/// column's type.
pub(crate) fn stage_on_disk(
    schema: &Schema,
    rows: Vec<Row>,
    datetime_format: &str,
    heuristics: bool,
) -> DgResult<Vec<Row>> {
    let mut staged = Vec::with_capacity(rows.len());
    for row in rows {
        let mut out = Row::new();
        for (key, value) in row {
            check_key(schema, &key)?;
            let column_type = schema.column_type(&key).ok_or_else(|| {
                DgError::Schema(format!(
                    "no such column '{}'; the schema of a saved grid is fixed",
                    key
                ))
            })?;
            let value = prepare(value, datetime_format, heuristics);
            out.insert(key.clone(), value.convert_to(column_type, &key)?);
        }
        staged.push(out);
    }
    Ok(staged)
}
