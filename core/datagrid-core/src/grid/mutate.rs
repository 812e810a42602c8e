//! Column and row removal, derived columns

use super::persist::{self, RowWriter};
use super::{DataGrid, Storage};
use crate::config::EngineContext;
use crate::error::{DgError, DgResult};
use crate::query::compile_expression;
use crate::stats;
use crate::storage::settings::GridSettings;
use crate::storage::{asset_store, catalog, sqlite};
use crate::types::{ColumnType, ROW_ID, Schema, Value, unify, verify_column_name};
use ahash::AHashSet;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, params, params_from_iter};
use tracing::{debug, info, instrument};

/// Contents of a new column.
#[derive(Debug, Clone)]
pub enum ColumnSource {
    /// One value per row, in row order
    Values(Vec<Value>),
    /// Expression evaluated per row; on-disk grids only
    Expression(String),
}

impl DataGrid {
    /// Drops columns and their asset companions.
    #[instrument(skip_all, fields(grid = %self.name))]
    pub fn remove_columns<S: AsRef<str>>(&mut self, names: &[S]) -> DgResult<()> {
        let mut schema = self.schema.clone();
        let mut removed = Vec::new();
        for name in names {
            removed.extend(schema.remove_column(name.as_ref())?);
        }

        match &mut self.storage {
            Storage::InMemory(memory) => {
                for column in &removed {
                    memory.declared.remove(&column.name);
                    memory.unresolved.remove(&column.name);
                    for row in &mut memory.rows {
                        row.shift_remove(&column.name);
                    }
                }
            }
            Storage::OnDisk { path } => {
                let mut conn = sqlite::open(&*path)?;
                let tx = conn.transaction()?;
                for column in &removed {
                    tx.execute_batch(&format!(
                        "ALTER TABLE datagrid DROP COLUMN {}",
                        column.field_name
                    ))?;
                    catalog::delete_column(&tx, &column.name)?;
                }
                let orphans = asset_store::delete_orphaned(&tx, &schema)?;
                stats::invalidate(&tx)?;
                tx.commit()?;
                debug!(orphans, "orphaned assets deleted");
            }
        }
        info!(removed = removed.len(), "columns removed");
        self.schema = schema;
        Ok(())
    }

    /// Deletes rows by row id and renumbers the rest 1..n in order.
    #[instrument(skip_all, fields(grid = %self.name, rows = row_ids.len()))]
    pub fn remove_rows(&mut self, row_ids: &[i64]) -> DgResult<()> {
        let doomed: AHashSet<i64> = row_ids.iter().copied().collect();
        match &mut self.storage {
            Storage::InMemory(memory) => {
                let mut index = 0i64;
                memory.rows.retain(|_| {
                    index += 1;
                    !doomed.contains(&index)
                });
                for (i, row) in memory.rows.iter_mut().enumerate() {
                    row.insert(ROW_ID.to_string(), Value::Integer(i as i64 + 1));
                }
            }
            Storage::OnDisk { path } => {
                let mut conn = sqlite::open(&*path)?;
                let tx = conn.transaction()?;
                for id in &doomed {
                    tx.execute("DELETE FROM datagrid WHERE column_0 = ?1", params![id])?;
                }
                renumber(&tx)?;
                let orphans = asset_store::delete_orphaned(&tx, &self.schema)?;
                stats::invalidate(&tx)?;
                tx.commit()?;
                conn.execute_batch("VACUUM")?;
                debug!(orphans, "rows removed and file compacted");
            }
        }
        Ok(())
    }

    /// Adds a column filled from literal values or an expression.
    ///
    /// Without an explicit type, the type is the unification of the values.
    #[instrument(skip_all, fields(grid = %self.name, column = name))]
    pub fn append_column(
        &mut self,
        name: &str,
        source: ColumnSource,
        column_type: Option<ColumnType>,
    ) -> DgResult<()> {
        verify_column_name(name)?;
        if self.schema.contains(name) {
            return Err(DgError::Schema(format!("column '{}' already exists", name)));
        }
        let (values, inferred) = match source {
            ColumnSource::Values(values) => {
                let inferred = infer_column_type(&values);
                (values, inferred)
            }
            ColumnSource::Expression(source) => {
                let path = self.disk_path("append_column with an expression")?;
                let conn = sqlite::open(path)?;
                evaluate_column(&conn, &self.schema, &source)?
            }
        };
        let row_count = self.row_count()?;
        if values.len() != row_count {
            return Err(DgError::InvalidArguments(format!(
                "column '{}' has {} values for {} rows",
                name,
                values.len(),
                row_count
            )));
        }
        let column_type = column_type.or(inferred).unwrap_or(ColumnType::Text);
        if let ColumnType::Asset(kind) = &column_type {
            self.context.registry.lookup(kind)?;
        }
        let values = values
            .iter()
            .map(|v| v.convert_to(&column_type, name))
            .collect::<DgResult<Vec<_>>>()?;

        let mut schema = self.schema.clone();
        schema.add_column(name, column_type)?;

        match &mut self.storage {
            Storage::InMemory(memory) => {
                for (row, value) in memory.rows.iter_mut().zip(values) {
                    row.insert(name.to_string(), value);
                }
                memory.declared.insert(name.to_string());
            }
            Storage::OnDisk { path } => {
                let mut conn = sqlite::open(&*path)?;
                let tx = conn.transaction()?;
                let added: Vec<_> = schema
                    .iter()
                    .filter(|c| !self.schema.contains(&c.name))
                    .cloned()
                    .collect();
                for column in &added {
                    tx.execute_batch(&format!(
                        "ALTER TABLE datagrid ADD COLUMN {}",
                        sqlite::column_definition(column)
                    ))?;
                    catalog::insert_column(&tx, column)?;
                }
                catalog::store_next_field(&tx, &schema)?;
                write_column(&tx, &schema, name, &values, &self.context, &self.settings)?;
                stats::invalidate(&tx)?;
                tx.commit()?;
            }
        }
        self.schema = schema;
        info!("column appended");
        Ok(())
    }
}

/// Reassigns row ids 1..n keeping order.
fn renumber(conn: &Connection) -> DgResult<()> {
    for (index, old) in persist::row_ids(conn)?.into_iter().enumerate() {
        let new = index as i64 + 1;
        if new != old {
            conn.execute(
                "UPDATE datagrid SET column_0 = ?1 WHERE column_0 = ?2",
                params![new, old],
            )?;
        }
    }
    Ok(())
}

fn infer_column_type(values: &[Value]) -> Option<ColumnType> {
    values
        .iter()
        .fold(None, |acc, v| unify(acc.as_ref(), v.infer_type().as_ref()))
}

/// Value of an expression result without a statically known type.
fn value_from_raw(raw: ValueRef<'_>) -> Value {
    match raw {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(_) => Value::Null,
    }
}

/// Evaluates `source` once per row, in row order.
fn evaluate_column(
    conn: &Connection,
    schema: &Schema,
    source: &str,
) -> DgResult<(Vec<Value>, Option<ColumnType>)> {
    let compiled = compile_expression(source, schema)?;
    let mut from = sqlite::DATAGRID_TABLE.to_string();
    for subquery in compiled.aggregates.values() {
        from.push_str(&format!(", ({})", subquery));
    }
    let sql = format!(
        "SELECT {} FROM {} ORDER BY datagrid.column_0",
        compiled.sql, from
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| DgError::execution(e, &sql))?;
    let mut rows = stmt.query([]).map_err(|e| DgError::execution(e, &sql))?;
    let mut values = Vec::new();
    while let Some(row) = rows.next().map_err(|e| DgError::execution(e, &sql))? {
        let raw = row.get_ref(0)?;
        values.push(match &compiled.column_type {
            Some(column_type) => Value::from_sql(column_type, raw)?,
            None => value_from_raw(raw),
        });
    }
    let inferred = compiled.column_type.or_else(|| infer_column_type(&values));
    debug!(sql = %sql, rows = values.len(), "expression evaluated");
    Ok((values, inferred))
}

fn write_column(
    conn: &Connection,
    schema: &Schema,
    name: &str,
    values: &[Value],
    context: &EngineContext,
    settings: &GridSettings,
) -> DgResult<()> {
    let field = schema.field_name(name)?.to_string();
    let companion = schema.companion_of(name).map(|c| c.field_name.clone());
    let sql = match &companion {
        Some(companion) => format!(
            "UPDATE datagrid SET {} = ?1, {} = ?2 WHERE column_0 = ?3",
            field, companion
        ),
        None => format!("UPDATE datagrid SET {} = ?1 WHERE column_0 = ?2", field),
    };
    let mut writer = RowWriter::new(conn, schema, context, settings)?;
    for (row_id, value) in persist::row_ids(conn)?.into_iter().zip(values) {
        let (cell, metadata) = writer.physical(conn, value)?;
        let mut params = vec![cell];
        if companion.is_some() {
            params.push(metadata);
        }
        params.push(SqlValue::Integer(row_id));
        conn.execute(&sql, params_from_iter(params))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::asset::Asset;
    use crate::types::Row;

    fn row(pairs: Vec<(&str, Value)>) -> Row {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn saved_grid(dir: &tempfile::TempDir) -> DataGrid {
        let mut grid = DataGrid::new("g");
        grid.extend(
            (1..=4)
                .map(|i| {
                    row(vec![
                        ("a", Value::Integer(i)),
                        ("b", Value::Integer(i * 10)),
                        ("img", Value::Asset(Asset::new("Image", vec![i as u8]))),
                    ])
                })
                .collect(),
        )
        .unwrap();
        grid.save(dir.path().join("m.datagrid")).unwrap();
        grid
    }

    #[test]
    fn test_remove_rows_renumbers() {
        let dir = tempfile::tempdir().unwrap();
        let mut grid = saved_grid(&dir);
        grid.remove_rows(&[2, 3]).unwrap();

        let rows = grid.rows().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["row-id"], Value::Integer(1));
        assert_eq!(rows[1]["row-id"], Value::Integer(2));
        assert_eq!(rows[1]["a"], Value::Integer(4));

        let conn = sqlite::open(grid.path().unwrap()).unwrap();
        assert_eq!(asset_store::asset_count(&conn).unwrap(), 2);
        assert!(stats::load(&conn, "a").unwrap().is_none());
    }

    #[test]
    fn test_remove_rows_in_memory() {
        let mut grid = DataGrid::new("g");
        grid.extend((0..3).map(|i| row(vec![("a", Value::Integer(i))])).collect())
            .unwrap();
        grid.remove_rows(&[1]).unwrap();
        let rows = grid.rows().unwrap();
        assert_eq!(rows[0]["a"], Value::Integer(1));
        assert_eq!(rows[0]["row-id"], Value::Integer(1));
    }

    #[test]
    fn test_remove_asset_column_deletes_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let mut grid = saved_grid(&dir);
        grid.remove_columns(&["img"]).unwrap();
        assert_eq!(grid.column_names(), vec!["row-id", "a", "b"]);
        assert!(grid.schema().companion_of("img").is_none());

        let conn = sqlite::open(grid.path().unwrap()).unwrap();
        assert_eq!(asset_store::asset_count(&conn).unwrap(), 0);
        let reopened = DataGrid::open(grid.path().unwrap()).unwrap();
        assert_eq!(reopened.schema(), grid.schema());
    }

    #[test]
    fn test_append_column_from_expression() {
        let dir = tempfile::tempdir().unwrap();
        let mut grid = saved_grid(&dir);
        grid.append_column(
            "sum",
            ColumnSource::Expression("{a} + {b}".to_string()),
            None,
        )
        .unwrap();
        assert_eq!(grid.schema().column_type("sum"), Some(&ColumnType::Integer));
        let rows = grid.rows().unwrap();
        assert_eq!(rows[3]["sum"], Value::Integer(44));

        grid.append_column(
            "share",
            ColumnSource::Expression("{a} / SUM({a})".to_string()),
            None,
        )
        .unwrap();
        assert_eq!(grid.rows().unwrap()[0]["share"], Value::Float(0.1));
    }

    #[test]
    fn test_append_column_values() {
        let mut grid = DataGrid::new("g");
        grid.extend((0..2).map(|i| row(vec![("a", Value::Integer(i))])).collect())
            .unwrap();
        assert!(matches!(
            grid.append_column("e", ColumnSource::Expression("{a}".into()), None),
            Err(DgError::Mode { .. })
        ));
        assert!(
            grid.append_column("c", ColumnSource::Values(vec![Value::Integer(1)]), None)
                .is_err()
        );
        grid.append_column(
            "c",
            ColumnSource::Values(vec![Value::Integer(1), Value::Float(0.5)]),
            None,
        )
        .unwrap();
        assert_eq!(grid.schema().column_type("c"), Some(&ColumnType::Float));
        assert_eq!(grid.rows().unwrap()[0]["c"], Value::Float(1.0));
    }

    #[test]
    fn test_append_asset_column_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut grid = saved_grid(&dir);
        let assets: Vec<Value> = (0..4)
            .map(|_| Value::Asset(Asset::new("Text", b"same".to_vec())))
            .collect();
        grid.append_column("doc", ColumnSource::Values(assets), None)
            .unwrap();
        let conn = sqlite::open(grid.path().unwrap()).unwrap();
        assert_eq!(asset_store::asset_count(&conn).unwrap(), 5);
        assert!(grid.schema().companion_of("doc").is_some());
    }
}
