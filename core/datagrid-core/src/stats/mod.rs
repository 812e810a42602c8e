//! Statistics engine
//!
//! Per-column aggregates are computed with SQL over the `datagrid` table and
//! cached in the statistics columns of `metadata`. A NULL `other` marks a
//! column whose statistics are stale; [`ensure_statistics`] recomputes those
//! on demand. Mutations call [`invalidate`].

pub mod projection;

use crate::config::EngineContext;
use crate::error::DgResult;
use crate::storage::asset::AssetRegistry;
use crate::types::{Column, ColumnType, Schema};
use indexmap::IndexMap;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use std::collections::BTreeSet;
use tracing::{debug, instrument};

/// Longest key path reported as a completion.
const MAX_COMPLETION_DEPTH: usize = 4;

/// Cached statistics of one column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnStatistics {
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub average: Option<f64>,
    /// Population variance
    pub variance: Option<f64>,
    pub total: Option<f64>,
    pub stddev: Option<f64>,
    /// Type-specific extras: `distinct`, `completions`, `dimensions` and
    /// per-asset-kind summaries
    pub other: JsonValue,
}

impl ColumnStatistics {
    pub fn distinct(&self) -> Option<u64> {
        self.other.get("distinct").and_then(JsonValue::as_u64)
    }

    pub fn completions(&self) -> Vec<String> {
        self.other
            .get("completions")
            .and_then(JsonValue::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Catalog row as reported by the `metadata` operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnMetadata {
    pub name: String,
    pub field_name: String,
    #[serde(rename = "type")]
    pub column_type: String,
    #[serde(flatten)]
    pub statistics: ColumnStatistics,
}

fn distinct_count(conn: &Connection, field: &str) -> DgResult<u64> {
    let sql = format!("SELECT COUNT(DISTINCT {0}) FROM datagrid", field);
    let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(n as u64)
}

fn numeric_statistics(conn: &Connection, field: &str) -> DgResult<ColumnStatistics> {
    let sql = format!(
        "SELECT MIN({0}), MAX({0}), AVG({0}), SUM({0}) FROM datagrid WHERE {0} IS NOT NULL",
        field
    );
    let (minimum, maximum, average, total): (Option<f64>, Option<f64>, Option<f64>, Option<f64>) =
        conn.query_row(&sql, [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
    let variance = match average {
        Some(mean) => {
            let sql = format!(
                "SELECT AVG(({0} - ?1) * ({0} - ?1)) FROM datagrid WHERE {0} IS NOT NULL",
                field
            );
            conn.query_row(&sql, params![mean], |row| row.get::<_, Option<f64>>(0))?
        }
        None => None,
    };
    Ok(ColumnStatistics {
        minimum,
        maximum,
        average,
        variance,
        total,
        stddev: variance.map(f64::sqrt),
        other: JsonValue::Null,
    })
}

/// Dotted key paths of a JSON document, objects only.
fn collect_paths(value: &JsonValue, prefix: &str, depth: usize, out: &mut BTreeSet<String>) {
    let JsonValue::Object(entries) = value else {
        return;
    };
    if depth >= MAX_COMPLETION_DEPTH {
        return;
    }
    for (key, child) in entries {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        collect_paths(child, &path, depth + 1, out);
        out.insert(path);
    }
}

fn json_documents(conn: &Connection, sql: &str) -> DgResult<Vec<JsonValue>> {
    let mut stmt = conn.prepare(sql)?;
    let texts = stmt
        .query_map([], |row| row.get::<_, Option<String>>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(texts
        .into_iter()
        .flatten()
        .filter_map(|text| serde_json::from_str(&text).ok())
        .collect())
}

fn completions(documents: &[JsonValue]) -> Vec<String> {
    let mut paths = BTreeSet::new();
    for doc in documents {
        collect_paths(doc, "", 0, &mut paths);
    }
    paths.into_iter().collect()
}

/// Computes the statistics of one column.
pub fn compute_column(
    conn: &Connection,
    column: &Column,
    registry: &AssetRegistry,
) -> DgResult<ColumnStatistics> {
    let field = column.field_name.as_str();
    let mut other = Map::new();
    other.insert("distinct".into(), json!(distinct_count(conn, field)?));

    let mut stats = match &column.column_type {
        ty if ty.is_numeric() => numeric_statistics(conn, field)?,
        ColumnType::Json => {
            let docs = json_documents(
                conn,
                &format!("SELECT {0} FROM datagrid WHERE {0} IS NOT NULL", field),
            )?;
            other.insert("completions".into(), json!(completions(&docs)));
            ColumnStatistics::default()
        }
        ColumnType::Vector => {
            let sql = format!("SELECT MAX(json_array_length({0})) FROM datagrid", field);
            let dims: Option<i64> = conn.query_row(&sql, [], |row| row.get(0))?;
            other.insert("dimensions".into(), json!(dims.unwrap_or(0)));
            ColumnStatistics::default()
        }
        ColumnType::Asset(kind) => {
            let docs = json_documents(
                conn,
                &format!(
                    "SELECT a.asset_metadata FROM datagrid d JOIN assets a ON a.asset_id = d.{0}",
                    field
                ),
            )?;
            other.insert("completions".into(), json!(completions(&docs)));
            if let Some(kind) = registry.get(kind) {
                let extras = kind.compute_statistics(&docs);
                if !extras.is_null() {
                    other.insert(kind.name().to_lowercase(), extras);
                }
            }
            ColumnStatistics::default()
        }
        _ => ColumnStatistics::default(),
    };
    stats.other = JsonValue::Object(other);
    Ok(stats)
}

pub fn store(conn: &Connection, name: &str, stats: &ColumnStatistics) -> DgResult<()> {
    conn.execute(
        "UPDATE metadata SET minimum = ?1, maximum = ?2, average = ?3, variance = ?4,
             total = ?5, stddev = ?6, other = ?7
         WHERE name = ?8",
        params![
            stats.minimum,
            stats.maximum,
            stats.average,
            stats.variance,
            stats.total,
            stats.stddev,
            stats.other.to_string(),
            name,
        ],
    )?;
    Ok(())
}

type StatisticsRow = (
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<String>,
);

fn read_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<StatisticsRow> {
    Ok((
        row.get(offset)?,
        row.get(offset + 1)?,
        row.get(offset + 2)?,
        row.get(offset + 3)?,
        row.get(offset + 4)?,
        row.get(offset + 5)?,
        row.get(offset + 6)?,
    ))
}

fn from_row(row: StatisticsRow) -> Option<ColumnStatistics> {
    let (minimum, maximum, average, variance, total, stddev, other) = row;
    let other = serde_json::from_str(&other?).ok()?;
    Some(ColumnStatistics {
        minimum,
        maximum,
        average,
        variance,
        total,
        stddev,
        other,
    })
}

/// Cached statistics; `None` when missing or invalidated.
pub fn load(conn: &Connection, name: &str) -> DgResult<Option<ColumnStatistics>> {
    let row = conn
        .query_row(
            "SELECT minimum, maximum, average, variance, total, stddev, other
             FROM metadata WHERE name = ?1",
            params![name],
            |row| read_row(row, 0),
        )
        .optional()?;
    Ok(row.and_then(from_row))
}

/// Marks every column's statistics stale.
pub fn invalidate(conn: &Connection) -> DgResult<()> {
    conn.execute(
        "UPDATE metadata SET minimum = NULL, maximum = NULL, average = NULL,
             variance = NULL, total = NULL, stddev = NULL, other = NULL",
        [],
    )?;
    Ok(())
}

/// Projects embedding columns, then recomputes every column.
#[instrument(skip_all)]
pub fn compute_all(conn: &Connection, schema: &Schema, ctx: &EngineContext) -> DgResult<()> {
    for column in schema.asset_columns() {
        if column.column_type.asset_kind() == Some("Embedding") {
            projection::project_column(
                conn,
                column,
                &ctx.registry,
                &ctx.cache,
                ctx.projector.as_ref(),
                ctx.config.max_projection_dimensions,
            )?;
        }
    }
    for column in schema.iter() {
        let stats = compute_column(conn, column, &ctx.registry)?;
        store(conn, &column.name, &stats)?;
    }
    debug!(columns = schema.len(), "statistics computed");
    Ok(())
}

/// Recomputes stale columns; returns how many were refreshed.
pub fn ensure_statistics(
    conn: &Connection,
    schema: &Schema,
    ctx: &EngineContext,
) -> DgResult<usize> {
    let mut stmt = conn.prepare("SELECT name FROM metadata WHERE other IS NULL")?;
    let stale = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut refreshed = 0;
    for name in &stale {
        if let Some(column) = schema.get(name) {
            let stats = compute_column(conn, column, &ctx.registry)?;
            store(conn, name, &stats)?;
            refreshed += 1;
        }
    }
    if refreshed > 0 {
        debug!(refreshed, "stale statistics recomputed");
    }
    Ok(refreshed)
}

/// Every catalog row in column order.
pub fn catalog(conn: &Connection) -> DgResult<IndexMap<String, ColumnMetadata>> {
    let mut stmt = conn.prepare(
        "SELECT name, field_name, type, minimum, maximum, average, variance, total, stddev, other
         FROM metadata ORDER BY rowid",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            read_row(row, 3)?,
        ))
    })?;
    let mut out = IndexMap::new();
    for row in rows {
        let (name, field_name, column_type, stats) = row?;
        out.insert(
            name.clone(),
            ColumnMetadata {
                name,
                field_name,
                column_type,
                statistics: from_row(stats).unwrap_or_default(),
            },
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{catalog, sqlite};

    fn grid() -> (tempfile::TempDir, Connection, Schema) {
        let dir = tempfile::tempdir().unwrap();
        let mut schema = Schema::new();
        schema.add_column("n", ColumnType::Integer).unwrap();
        schema.add_column("meta", ColumnType::Json).unwrap();
        let conn = sqlite::create(dir.path().join("s.datagrid"), &schema).unwrap();
        catalog::store_schema(&conn, &schema).unwrap();
        conn.execute_batch(
            r#"INSERT INTO datagrid VALUES (1, 2, '{"a": {"b": 1}}');
               INSERT INTO datagrid VALUES (2, 4, '{"c": 2}');
               INSERT INTO datagrid VALUES (3, 4, NULL);
               INSERT INTO datagrid VALUES (4, 6, NULL);"#,
        )
        .unwrap();
        (dir, conn, schema)
    }

    #[test]
    fn test_numeric_statistics() {
        let (_dir, conn, schema) = grid();
        let stats = compute_column(&conn, schema.get("n").unwrap(), &AssetRegistry::default())
            .unwrap();
        assert_eq!(stats.minimum, Some(2.0));
        assert_eq!(stats.maximum, Some(6.0));
        assert_eq!(stats.average, Some(4.0));
        assert_eq!(stats.total, Some(16.0));
        assert_eq!(stats.variance, Some(2.0));
        assert_eq!(stats.distinct(), Some(3));
    }

    #[test]
    fn test_json_completions() {
        let (_dir, conn, schema) = grid();
        let stats = compute_column(&conn, schema.get("meta").unwrap(), &AssetRegistry::default())
            .unwrap();
        assert_eq!(stats.completions(), vec!["a", "a.b", "c"]);
        assert_eq!(stats.minimum, None);
    }

    #[test]
    fn test_invalidate_and_ensure() {
        let (_dir, conn, schema) = grid();
        let ctx = EngineContext::default();
        compute_all(&conn, &schema, &ctx).unwrap();
        assert!(load(&conn, "n").unwrap().is_some());

        invalidate(&conn).unwrap();
        assert!(load(&conn, "n").unwrap().is_none());
        assert_eq!(ensure_statistics(&conn, &schema, &ctx).unwrap(), schema.len());
        assert_eq!(load(&conn, "n").unwrap().unwrap().maximum, Some(6.0));
        assert_eq!(ensure_statistics(&conn, &schema, &ctx).unwrap(), 0);

        let catalog = catalog(&conn).unwrap();
        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog["n"].column_type, "INTEGER");
        assert_eq!(catalog["n"].statistics.average, Some(4.0));
    }
}
