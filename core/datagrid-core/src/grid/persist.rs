//! Saving grids and moving rows between [`Row`] maps and the `datagrid`
//! table

use super::{DataGrid, Storage};
use crate::config::EngineContext;
use crate::error::DgResult;
use crate::stats;
use crate::storage::asset_store::{self, AssetLogSession, LogOptions};
use crate::storage::settings::GridSettings;
use crate::storage::{catalog, sqlite};
use crate::types::{Row, Schema, Value};
use ahash::AHashMap;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params_from_iter};
use std::path::Path;
use tracing::{info, instrument};

/// Inserts rows, logging inline assets once per operation.
pub(crate) struct RowWriter<'a> {
    schema: &'a Schema,
    session: AssetLogSession,
    options: LogOptions<'a>,
    sql: String,
}

impl<'a> RowWriter<'a> {
    pub(crate) fn new(
        conn: &Connection,
        schema: &'a Schema,
        context: &'a EngineContext,
        settings: &GridSettings,
    ) -> DgResult<Self> {
        let fields: Vec<&str> = schema.iter().map(|c| c.field_name.as_str()).collect();
        let placeholders: Vec<String> = (1..=fields.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            sqlite::DATAGRID_TABLE,
            fields.join(", "),
            placeholders.join(", ")
        );
        Ok(Self {
            schema,
            session: AssetLogSession::begin(conn)?,
            options: log_options(context, settings),
            sql,
        })
    }

    /// Writes one row; missing columns are NULL.
    pub(crate) fn insert(&mut self, conn: &Connection, row_id: i64, row: &Row) -> DgResult<()> {
        let mut cells = self.cells(conn, row)?;
        let params: Vec<SqlValue> = self
            .schema
            .iter()
            .map(|column| {
                if column.is_row_id() {
                    SqlValue::Integer(row_id)
                } else {
                    cells.remove(column.name.as_str()).unwrap_or(SqlValue::Null)
                }
            })
            .collect();
        conn.execute(&self.sql, params_from_iter(params))?;
        Ok(())
    }

    /// Physical values of the user columns of `row`, companions included.
    pub(crate) fn cells(
        &mut self,
        conn: &Connection,
        row: &Row,
    ) -> DgResult<AHashMap<&'a str, SqlValue>> {
        let schema = self.schema;
        let mut cells = AHashMap::new();
        for column in schema.user_columns() {
            let Some(value) = row.get(&column.name) else {
                continue;
            };
            let (cell, metadata) = self.physical(conn, value)?;
            cells.insert(column.name.as_str(), cell);
            if let Some(companion) = schema.companion_of(&column.name) {
                cells.insert(companion.name.as_str(), metadata);
            }
        }
        Ok(cells)
    }

    /// A value's cell plus its companion metadata cell.
    pub(crate) fn physical(
        &mut self,
        conn: &Connection,
        value: &Value,
    ) -> DgResult<(SqlValue, SqlValue)> {
        Ok(match value {
            Value::Asset(asset) => {
                let id = self.session.log(conn, asset, &self.options)?;
                (SqlValue::Text(id), SqlValue::Text(asset.metadata().to_string()))
            }
            Value::AssetRef { asset_id, .. } => {
                let metadata = asset_store::asset_metadata(conn, asset_id)?;
                (
                    SqlValue::Text(asset_id.clone()),
                    SqlValue::Text(metadata.to_string()),
                )
            }
            other => (other.to_sql(), SqlValue::Null),
        })
    }

    pub(crate) fn inserted(&self) -> usize {
        self.session.inserted()
    }
}

pub(crate) fn log_options<'a>(
    context: &'a EngineContext,
    settings: &GridSettings,
) -> LogOptions<'a> {
    LogOptions {
        registry: &context.registry,
        thumbnailer: context.thumbnailer.as_ref(),
        pregenerate_thumbnails: settings.pregenerate_thumbnails,
    }
}

pub(crate) fn count_rows(conn: &Connection) -> DgResult<usize> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM datagrid", [], |row| row.get(0))?;
    Ok(n as usize)
}

pub(crate) fn max_row_id(conn: &Connection) -> DgResult<i64> {
    let id: Option<i64> = conn.query_row("SELECT MAX(column_0) FROM datagrid", [], |row| {
        row.get(0)
    })?;
    Ok(id.unwrap_or(0))
}

/// Row ids in order.
pub(crate) fn row_ids(conn: &Connection) -> DgResult<Vec<i64>> {
    let mut stmt = conn.prepare("SELECT column_0 FROM datagrid ORDER BY column_0")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

/// An in-memory row with every visible column converted to its current type.
pub(crate) fn typed_row(schema: &Schema, row: &Row) -> DgResult<Row> {
    let mut out = Row::new();
    for column in schema.visible_columns() {
        let value = match row.get(&column.name) {
            Some(value) => value.convert_to(&column.column_type, &column.name)?,
            None => Value::Null,
        };
        out.insert(column.name.clone(), value);
    }
    Ok(out)
}

pub(crate) fn read_rows(conn: &Connection, schema: &Schema) -> DgResult<Vec<Row>> {
    let columns: Vec<_> = schema.visible_columns().collect();
    let fields: Vec<&str> = columns.iter().map(|c| c.field_name.as_str()).collect();
    let sql = format!(
        "SELECT {} FROM datagrid ORDER BY column_0",
        fields.join(", ")
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Row::new();
        for (i, column) in columns.iter().enumerate() {
            values.insert(
                column.name.clone(),
                Value::from_sql(&column.column_type, row.get_ref(i)?)?,
            );
        }
        out.push(values);
    }
    Ok(out)
}

impl DataGrid {
    /// Writes the grid to `path` and switches it to on-disk mode.
    ///
    /// Saving an on-disk grid to its own file refreshes the statistics; to
    /// another file copies it and re-points the grid.
    #[instrument(skip_all, fields(grid = %self.name, path = %path.as_ref().display()))]
    pub fn save(&mut self, path: impl AsRef<Path>) -> DgResult<()> {
        let path = path.as_ref();
        match &self.storage {
            Storage::OnDisk { path: current } => {
                if !same_file(current, path) {
                    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::copy(current, path)?;
                    info!(from = %current.display(), "grid copied");
                }
                let conn = sqlite::open(path)?;
                stats::compute_all(&conn, &self.schema, &self.context)?;
            }
            Storage::InMemory(memory) => {
                let mut conn = sqlite::create(path, &self.schema)?;
                let tx = conn.transaction()?;
                catalog::store_schema(&tx, &self.schema)?;
                self.settings.store(&tx)?;
                let mut writer = RowWriter::new(&tx, &self.schema, &self.context, &self.settings)?;
                for (index, row) in memory.rows.iter().enumerate() {
                    let row = typed_row(&self.schema, row)?;
                    writer.insert(&tx, index as i64 + 1, &row)?;
                }
                let assets = writer.inserted();
                tx.commit()?;
                stats::compute_all(&conn, &self.schema, &self.context)?;
                info!(rows = memory.rows.len(), assets, "grid saved");
            }
        }
        self.storage = Storage::OnDisk {
            path: path.to_path_buf(),
        };
        Ok(())
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}
