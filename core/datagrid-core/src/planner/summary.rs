//! Group-by value transfer and the summaries built on it
//!
//! The values of one column across the rows of one group travel as a single
//! `GROUP_CONCAT` string: each value is cast to text, literal commas are
//! replaced by [`COMMA_ESCAPE`], and the values are joined with commas. The
//! reader splits on commas and restores the escaped ones. A value that itself
//! contains the escape sequence does not survive the trip.

use super::types::{CategorySummary, Description, Histogram, HistogramBin, SummaryRequest};
use super::{execute_error, prepare};
use crate::config::EngineContext;
use crate::error::{DgError, DgResult};
use crate::query::functions::json_to_sql;
use crate::query::{CompiledQuery, compile};
use crate::types::value::{format_datetime, format_float};
use crate::types::{ColumnType, Schema, Value};
use indexmap::IndexMap;
use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, instrument};

pub const COMMA_ESCAPE: &str = "&comma;";

/// SQL aggregating `expr` into one escaped, comma-joined string.
pub fn group_concat_sql(expr: &str) -> String {
    format!(
        "GROUP_CONCAT(REPLACE(CAST({} AS TEXT), ',', '{}'), ',')",
        expr, COMMA_ESCAPE
    )
}

/// Inverse of [`group_concat_sql`].
pub fn split_group_values(concatenated: Option<&str>) -> Vec<String> {
    match concatenated {
        Some(text) => text
            .split(',')
            .map(|part| part.replace(COMMA_ESCAPE, ","))
            .collect(),
        None => Vec::new(),
    }
}

/// Values of a column within a group, in row order, NULLs skipped.
#[derive(Debug, Clone)]
pub(crate) struct GroupValues {
    pub(crate) column_type: Option<ColumnType>,
    pub(crate) values: Vec<String>,
}

fn group_param(value: &JsonValue) -> SqlValue {
    match value.get("assetId").and_then(JsonValue::as_str) {
        Some(id) => SqlValue::Text(id.to_string()),
        None => json_to_sql(value.clone()),
    }
}

fn group_filter(
    schema: &Schema,
    compiled: &CompiledQuery,
    request: &SummaryRequest,
) -> DgResult<(Vec<String>, Vec<SqlValue>)> {
    let mut conditions: Vec<String> = compiled.where_sql.iter().cloned().collect();
    let mut params = Vec::new();
    if let Some(group_by) = &request.group_by {
        let group_sql = compiled.field_sql(group_by, schema)?;
        match request.column_value.as_ref().filter(|v| !v.is_null()) {
            Some(value) => {
                conditions.push(format!("{} = ?1", group_sql));
                params.push(group_param(value));
            }
            None => conditions.push(format!("{} IS NULL", group_sql)),
        }
    }
    Ok((conditions, params))
}

#[instrument(skip_all, fields(column = %request.column_name))]
pub(crate) fn group_values(
    conn: &Connection,
    schema: &Schema,
    request: &SummaryRequest,
) -> DgResult<GroupValues> {
    let compiled = compile(
        request.where_expr.as_deref(),
        &request.computed_columns,
        schema,
    )?;
    let target = compiled.field_sql(&request.column_name, schema)?;
    let column_type = compiled.column_type(&request.column_name, schema);
    let (conditions, params) = group_filter(schema, &compiled, request)?;
    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };
    let sql = format!(
        "SELECT {} FROM (SELECT {} AS v FROM {}{} ORDER BY datagrid.column_0)",
        group_concat_sql("v"),
        target,
        compiled.from_clause(),
        where_clause
    );
    debug!(sql = %sql, "group values");

    let mut stmt = prepare(conn, &sql)?;
    let concatenated: Option<String> = stmt
        .query_row(rusqlite::params_from_iter(params), |row| row.get(0))
        .map_err(|e| execute_error(e, &sql))?;
    Ok(GroupValues {
        column_type,
        values: split_group_values(concatenated.as_deref()),
    })
}

/// Display label of a transferred value.
fn label(column_type: Option<&ColumnType>, text: &str) -> String {
    match column_type {
        Some(ColumnType::Boolean) => match text {
            "0" => "False".to_string(),
            "1" => "True".to_string(),
            other => other.to_string(),
        },
        Some(ColumnType::Datetime) => text
            .parse::<f64>()
            .map(format_datetime)
            .unwrap_or_else(|_| text.to_string()),
        _ => text.to_string(),
    }
}

/// Typed JSON of a transferred value.
fn typed_json(column_type: Option<&ColumnType>, text: &str) -> JsonValue {
    let value = match column_type {
        Some(ColumnType::Boolean) => Value::Boolean(text != "0"),
        Some(ColumnType::Integer | ColumnType::RowId) => match text.parse() {
            Ok(i) => Value::Integer(i),
            Err(_) => Value::Text(text.to_string()),
        },
        Some(ColumnType::Float) => text
            .parse()
            .map_or_else(|_| Value::Text(text.to_string()), Value::Float),
        Some(ColumnType::Datetime) => text
            .parse()
            .map_or_else(|_| Value::Text(text.to_string()), Value::Datetime),
        Some(ColumnType::Json | ColumnType::Vector) => serde_json::from_str(text)
            .map_or_else(|_| Value::Text(text.to_string()), Value::Json),
        Some(ColumnType::Asset(kind)) => Value::AssetRef {
            asset_type: kind.clone(),
            asset_id: text.to_string(),
        },
        Some(ColumnType::Text) | None => Value::Text(text.to_string()),
    };
    value.to_json()
}

// ════════════════════════════════════════════
// Histogram
// ════════════════════════════════════════════

/// Linear interpolation between closest ranks.
fn quantile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let position = q * (sorted.len() - 1) as f64;
    let (lo, hi) = (position.floor() as usize, position.ceil() as usize);
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (position - lo as f64))
}

/// Equal-width bins over `[min, max]`; the last bin is closed.
pub fn histogram(values: &[f64], bins: usize) -> Histogram {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);
    let count = sorted.len();
    let (Some(&min), Some(&max)) = (sorted.first(), sorted.last()) else {
        return Histogram {
            bins: Vec::new(),
            count: 0,
            min: None,
            max: None,
            mean: None,
            median: None,
            stddev: None,
            q1: None,
            q3: None,
        };
    };

    let bins = bins.max(1);
    let width = (max - min) / bins as f64;
    let mut counts = vec![0usize; bins];
    for v in &sorted {
        let index = if width > 0.0 {
            (((v - min) / width).floor() as usize).min(bins - 1)
        } else {
            0
        };
        counts[index] += 1;
    }
    let edges = counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| HistogramBin {
            low: min + width * i as f64,
            high: if i + 1 == bins { max } else { min + width * (i + 1) as f64 },
            count,
        })
        .collect();

    let mean = sorted.iter().sum::<f64>() / count as f64;
    let variance = sorted.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / count as f64;
    Histogram {
        bins: edges,
        count,
        min: Some(min),
        max: Some(max),
        mean: Some(mean),
        median: quantile(&sorted, 0.5),
        stddev: Some(variance.sqrt()),
        q1: quantile(&sorted, 0.25),
        q3: quantile(&sorted, 0.75),
    }
}

pub fn select_histogram(
    conn: &Connection,
    schema: &Schema,
    request: &SummaryRequest,
    context: &EngineContext,
) -> DgResult<Histogram> {
    let group = group_values(conn, schema, request)?;
    if let Some(column_type) = &group.column_type {
        if !column_type.is_numeric() {
            return Err(DgError::InvalidArguments(format!(
                "cannot build a histogram of {} column '{}'",
                column_type, request.column_name
            )));
        }
    }
    let values: Vec<f64> = group
        .values
        .iter()
        .filter_map(|v| v.parse::<f64>().ok())
        .collect();
    Ok(histogram(&values, context.config.histogram_bins))
}

// ════════════════════════════════════════════
// Category / description
// ════════════════════════════════════════════

/// Breakdown when `2 <= unique <= max_unique`, verbatim otherwise.
pub fn categorize(labels: &[String], max_unique: usize) -> CategorySummary {
    let mut counts: IndexMap<String, usize> = IndexMap::new();
    for label in labels {
        *counts.entry(label.clone()).or_default() += 1;
    }
    let (total, unique) = (labels.len(), counts.len());
    if unique < 2 || unique > max_unique {
        return CategorySummary::Verbatim {
            total,
            unique,
            values: counts.into_keys().take(max_unique.max(1)).collect(),
        };
    }
    counts.sort_by(|ka, a, kb, b| b.cmp(a).then_with(|| ka.cmp(kb)));
    CategorySummary::Category {
        total,
        unique,
        category: counts,
    }
}

pub fn select_category(
    conn: &Connection,
    schema: &Schema,
    request: &SummaryRequest,
    context: &EngineContext,
) -> DgResult<CategorySummary> {
    let group = group_values(conn, schema, request)?;
    let labels: Vec<String> = group
        .values
        .iter()
        .map(|v| label(group.column_type.as_ref(), v))
        .collect();
    Ok(categorize(&labels, context.config.max_category_unique))
}

pub fn select_description(
    conn: &Connection,
    schema: &Schema,
    request: &SummaryRequest,
) -> DgResult<Description> {
    let group = group_values(conn, schema, request)?;
    let column_type = group.column_type.as_ref();
    Ok(match group.values.as_slice() {
        [single] => Description {
            count: 1,
            value: Some(typed_json(column_type, single)),
            text: label(column_type, single),
        },
        values => Description {
            count: values.len(),
            value: None,
            text: format!("{} values", values.len()),
        },
    })
}

/// Numeric label used by histogram-style clients for one bin.
pub fn bin_label(bin: &HistogramBin) -> String {
    format!("{} - {}", format_float(bin.low), format_float(bin.high))
}

/// Summary object keyed the way clients read it.
pub fn histogram_json(histogram: &Histogram) -> JsonValue {
    json!({
        "labels": histogram.bins.iter().map(bin_label).collect::<Vec<_>>(),
        "counts": histogram.bins.iter().map(|b| b.count).collect::<Vec<_>>(),
        "min": histogram.min,
        "max": histogram.max,
        "mean": histogram.mean,
        "median": histogram.median,
        "stddev": histogram.stddev,
        "q1": histogram.q1,
        "q3": histogram.q3,
    })
}
