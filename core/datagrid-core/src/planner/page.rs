//! Paginated, sorted and grouped row queries

use super::types::{QueryPage, QueryRequest};
use super::{endpoint_for, execute_error, prepare};
use crate::config::EngineContext;
use crate::error::{DgError, DgResult};
use crate::query::functions::sql_to_json;
use crate::query::{CompiledQuery, compile};
use crate::types::{ColumnType, Schema, Value, unify};
use indexmap::IndexMap;
use rusqlite::Connection;
use rusqlite::types::ValueRef;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, instrument};

/// A column of the SELECT list.
#[derive(Debug, Clone)]
struct Selected {
    name: String,
    sql: String,
    alias: String,
    column_type: Option<ColumnType>,
}

fn select_list(
    schema: &Schema,
    compiled: &CompiledQuery,
    request: &QueryRequest,
) -> DgResult<Vec<Selected>> {
    let names: Vec<String> = match &request.select_columns {
        Some(names) => names.clone(),
        None => schema
            .names()
            .into_iter()
            .chain(compiled.computed.keys().cloned())
            .collect(),
    };
    names
        .into_iter()
        .map(|name| {
            let sql = compiled.field_sql(&name, schema)?;
            let alias = match compiled.computed.get(&name) {
                Some(cc) => cc.field_name.clone(),
                None => schema.field_name(&name)?.to_string(),
            };
            let column_type = compiled.column_type(&name, schema);
            Ok(Selected {
                name,
                sql,
                alias,
                column_type,
            })
        })
        .collect()
}

fn order_clause(
    schema: &Schema,
    compiled: &CompiledQuery,
    request: &QueryRequest,
) -> DgResult<String> {
    let direction = if request.sort_desc { "DESC" } else { "ASC" };
    match &request.sort_by {
        Some(column) => Ok(format!(
            " ORDER BY {} {}, datagrid.column_0 ASC",
            compiled.field_sql(column, schema)?,
            direction
        )),
        None => Ok(format!(" ORDER BY datagrid.column_0 {}", direction)),
    }
}

/// Cell reshaped for the client.
pub(crate) fn cell_json(
    column_type: Option<&ColumnType>,
    raw: ValueRef<'_>,
) -> DgResult<JsonValue> {
    match column_type {
        Some(column_type) => Ok(Value::from_sql(column_type, raw)?.to_json()),
        None => Ok(sql_to_json(raw)),
    }
}

/// Type of a column whose SQL type is unknown, read off its values.
fn observed_type(raw: ValueRef<'_>) -> Option<ColumnType> {
    match raw {
        ValueRef::Integer(_) => Some(ColumnType::Integer),
        ValueRef::Real(_) => Some(ColumnType::Float),
        ValueRef::Text(_) => Some(ColumnType::Text),
        _ => None,
    }
}

/// One page of rows, or of groups when `group_by` is set.
#[instrument(skip_all, fields(where_expr = request.where_expr.as_deref().unwrap_or("")))]
pub fn select_query_page(
    conn: &Connection,
    schema: &Schema,
    request: &QueryRequest,
    context: &EngineContext,
) -> DgResult<QueryPage> {
    let compiled = compile(
        request.where_expr.as_deref(),
        &request.computed_columns,
        schema,
    )?;
    let selected = select_list(schema, &compiled, request)?;
    let limit = request.limit.unwrap_or(context.config.default_page_size);
    match &request.group_by {
        Some(group_by) => {
            grouped_page(conn, schema, &compiled, request, &selected, group_by, limit)
        }
        None => flat_page(conn, schema, &compiled, request, &selected, limit),
    }
}

fn flat_page(
    conn: &Connection,
    schema: &Schema,
    compiled: &CompiledQuery,
    request: &QueryRequest,
    selected: &[Selected],
    limit: usize,
) -> DgResult<QueryPage> {
    let fields: Vec<String> = selected
        .iter()
        .map(|s| format!("{} AS {}", s.sql, s.alias))
        .collect();
    let sql = format!(
        "SELECT {} FROM {}{}{} LIMIT {} OFFSET {}",
        fields.join(", "),
        compiled.from_clause(),
        compiled.where_clause(),
        order_clause(schema, compiled, request)?,
        limit,
        request.offset
    );
    debug!(sql = %sql, "page query");

    let mut stmt = prepare(conn, &sql)?;
    let mut rows = stmt.query([]).map_err(|e| execute_error(e, &sql))?;
    let mut types: Vec<Option<ColumnType>> =
        selected.iter().map(|s| s.column_type.clone()).collect();
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| execute_error(e, &sql))? {
        let mut cells = IndexMap::with_capacity(selected.len());
        for (i, column) in selected.iter().enumerate() {
            let raw = row.get_ref(i)?;
            if column.column_type.is_none() {
                types[i] = unify(types[i].as_ref(), observed_type(raw).as_ref());
            }
            cells.insert(
                column.name.clone(),
                cell_json(column.column_type.as_ref(), raw)?,
            );
        }
        out.push(cells);
    }
    Ok(page(selected, &types, out))
}

fn page(
    selected: &[Selected],
    types: &[Option<ColumnType>],
    rows: Vec<IndexMap<String, JsonValue>>,
) -> QueryPage {
    QueryPage {
        columns: selected.iter().map(|s| s.name.clone()).collect(),
        column_types: types
            .iter()
            .map(|t| t.as_ref().map_or_else(|| ColumnType::Text.to_string(), ToString::to_string))
            .collect(),
        nrows: rows.len(),
        ncols: selected.len(),
        rows,
    }
}

/// One row per distinct group value; every other column becomes a
/// `row-group` reference naming the summary endpoint that expands it.
fn grouped_page(
    conn: &Connection,
    schema: &Schema,
    compiled: &CompiledQuery,
    request: &QueryRequest,
    selected: &[Selected],
    group_by: &str,
    limit: usize,
) -> DgResult<QueryPage> {
    let group_sql = compiled.field_sql(group_by, schema)?;
    let group_type = compiled.column_type(group_by, schema);
    if !selected.iter().any(|s| s.name == group_by) {
        return Err(DgError::InvalidArguments(format!(
            "group column '{}' is not selected",
            group_by
        )));
    }
    let direction = if request.sort_desc { "DESC" } else { "ASC" };
    let sql = format!(
        "SELECT {0} AS g, COUNT(*) AS n FROM {1}{2} \
         GROUP BY {0} ORDER BY g {3} LIMIT {4} OFFSET {5}",
        group_sql,
        compiled.from_clause(),
        compiled.where_clause(),
        direction,
        limit,
        request.offset
    );
    debug!(sql = %sql, "grouped page query");

    let mut stmt = prepare(conn, &sql)?;
    let mut rows = stmt.query([]).map_err(|e| execute_error(e, &sql))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| execute_error(e, &sql))? {
        let group_value = cell_json(group_type.as_ref(), row.get_ref(0)?)?;
        let count: i64 = row.get(1)?;
        let mut cells = IndexMap::with_capacity(selected.len());
        for column in selected {
            let cell = if column.name == group_by {
                group_value.clone()
            } else {
                json!({
                    "type": "row-group",
                    "columnName": column.name,
                    "columnType": column.column_type.as_ref().map(ToString::to_string),
                    "groupBy": group_by,
                    "columnValue": group_value,
                    "count": count,
                    "endpoint": endpoint_for(column.column_type.as_ref()),
                })
            };
            cells.insert(column.name.clone(), cell);
        }
        out.push(cells);
    }
    let types: Vec<Option<ColumnType>> = selected.iter().map(|s| s.column_type.clone()).collect();
    Ok(page(selected, &types, out))
}

/// Matching rows, or groups when `group_by` is set; ignores pagination.
pub fn select_query_count(
    conn: &Connection,
    schema: &Schema,
    request: &QueryRequest,
) -> DgResult<usize> {
    let compiled = compile(
        request.where_expr.as_deref(),
        &request.computed_columns,
        schema,
    )?;
    let sql = match &request.group_by {
        Some(group_by) => format!(
            "SELECT COUNT(*) FROM (SELECT 1 FROM {}{} GROUP BY {})",
            compiled.from_clause(),
            compiled.where_clause(),
            compiled.field_sql(group_by, schema)?
        ),
        None => format!(
            "SELECT COUNT(*) FROM {}{}",
            compiled.from_clause(),
            compiled.where_clause()
        ),
    };
    let total: i64 = conn
        .query_row(&sql, [], |row| row.get(0))
        .map_err(|e| execute_error(e, &sql))?;
    Ok(total as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::tests::fixture;

    #[test]
    fn test_page_with_filter_and_sort() {
        let (_dir, grid) = fixture();
        let conn = crate::storage::sqlite::open(grid.path().unwrap()).unwrap();
        let request = QueryRequest::new()
            .with_where("{score} > 1")
            .sorted_by("score", true)
            .with_limit(2);
        let page = select_query_page(&conn, grid.schema(), &request, grid.context()).unwrap();
        assert_eq!(page.nrows, 2);
        assert_eq!(page.columns, vec!["row-id", "name", "score", "img"]);
        assert_eq!(page.column_types[2], "FLOAT");
        assert_eq!(page.rows[0]["score"], json!(4.0));
        assert_eq!(page.rows[1]["score"], json!(3.0));
        assert_eq!(page.rows[0]["img"]["type"], json!("asset"));

        assert_eq!(select_query_count(&conn, grid.schema(), &request).unwrap(), 3);
    }

    /// 에셋 메타데이터를 헬퍼 함수로 거르기
    #[test]
    fn test_filters_through_asset_metadata() {
        let (_dir, grid) = fixture();
        let conn = crate::storage::sqlite::open(grid.path().unwrap()).unwrap();
        let count = |where_expr: &str| {
            let request = QueryRequest::new().with_where(where_expr);
            select_query_count(&conn, grid.schema(), &request).unwrap()
        };
        assert_eq!(count("len({'img'}.annotations) == 1"), 4);
        assert_eq!(count("'og' in {'img'}.annotations[0].data[0].label"), 3);
        assert_eq!(
            count("{'img'}.annotations[0].data[{'score'} > 5]['label'] == 'cat'"),
            1
        );
    }

    #[test]
    fn test_page_with_computed_column() {
        let (_dir, grid) = fixture();
        let conn = crate::storage::sqlite::open(grid.path().unwrap()).unwrap();
        let request = QueryRequest::new()
            .with_computed("double", "{score} * 2")
            .with_where("{double} >= 6")
            .selecting(["name", "double"]);
        let page = select_query_page(&conn, grid.schema(), &request, grid.context()).unwrap();
        assert_eq!(page.columns, vec!["name", "double"]);
        assert_eq!(page.nrows, 2);
        assert_eq!(page.rows[0]["double"], json!(6.0));
    }

    #[test]
    fn test_grouped_page() {
        let (_dir, grid) = fixture();
        let conn = crate::storage::sqlite::open(grid.path().unwrap()).unwrap();
        let request = QueryRequest::new().grouped_by("name");
        let page = select_query_page(&conn, grid.schema(), &request, grid.context()).unwrap();
        assert_eq!(page.nrows, 2);
        assert_eq!(page.rows[0]["name"], json!("cat"));
        let reference = &page.rows[1]["score"];
        assert_eq!(reference["type"], json!("row-group"));
        assert_eq!(reference["columnValue"], json!("dog"));
        assert_eq!(reference["count"], json!(3));
        assert_eq!(reference["endpoint"], json!("histogram"));
        assert_eq!(page.rows[1]["img"]["endpoint"], json!("asset-group"));

        assert_eq!(select_query_count(&conn, grid.schema(), &request).unwrap(), 2);
    }

    #[test]
    fn test_unknown_sort_column() {
        let (_dir, grid) = fixture();
        let conn = crate::storage::sqlite::open(grid.path().unwrap()).unwrap();
        let request = QueryRequest::new().sorted_by("nope", false);
        assert!(select_query_page(&conn, grid.schema(), &request, grid.context()).is_err());
    }
}
