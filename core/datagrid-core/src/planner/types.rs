//! Request and result shapes of the query planner

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One page query over a grid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryRequest {
    pub where_expr: Option<String>,
    /// Name → expression, in declaration order
    pub computed_columns: IndexMap<String, String>,
    pub sort_by: Option<String>,
    pub sort_desc: bool,
    /// Page size; the engine default when absent
    pub limit: Option<usize>,
    pub offset: usize,
    pub group_by: Option<String>,
    /// Columns to return; visible and computed columns when absent
    pub select_columns: Option<Vec<String>>,
}

impl QueryRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_where(mut self, expr: impl Into<String>) -> Self {
        self.where_expr = Some(expr.into());
        self
    }

    pub fn with_computed(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.computed_columns.insert(name.into(), expr.into());
        self
    }

    pub fn sorted_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.sort_by = Some(column.into());
        self.sort_desc = descending;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn grouped_by(mut self, column: impl Into<String>) -> Self {
        self.group_by = Some(column.into());
        self
    }

    pub fn selecting<S: Into<String>>(mut self, columns: impl IntoIterator<Item = S>) -> Self {
        self.select_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }
}

/// Target of a summary endpoint: one column, optionally restricted to the
/// rows of one group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SummaryRequest {
    pub column_name: String,
    pub group_by: Option<String>,
    /// Group value selecting the rows; only read with `group_by`
    pub column_value: Option<JsonValue>,
    pub where_expr: Option<String>,
    pub computed_columns: IndexMap<String, String>,
}

impl SummaryRequest {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column_name: column.into(),
            ..Self::default()
        }
    }

    /// Restricts to rows whose `group_by` column equals `value`.
    pub fn in_group(mut self, group_by: impl Into<String>, value: JsonValue) -> Self {
        self.group_by = Some(group_by.into());
        self.column_value = Some(value);
        self
    }

    pub fn with_where(mut self, expr: impl Into<String>) -> Self {
        self.where_expr = Some(expr.into());
        self
    }

    pub fn with_computed(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.computed_columns.insert(name.into(), expr.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPage {
    pub columns: Vec<String>,
    pub column_types: Vec<String>,
    pub nrows: usize,
    pub ncols: usize,
    pub rows: Vec<IndexMap<String, JsonValue>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistogramBin {
    pub low: f64,
    pub high: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Histogram {
    pub bins: Vec<HistogramBin>,
    pub count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    /// Population standard deviation
    pub stddev: Option<f64>,
    pub q1: Option<f64>,
    pub q3: Option<f64>,
}

/// Frequency breakdown of a group, or its values verbatim when a breakdown
/// would not be informative.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CategorySummary {
    Category {
        total: usize,
        unique: usize,
        /// Label → count, most frequent first
        category: IndexMap<String, usize>,
    },
    Verbatim {
        total: usize,
        unique: usize,
        values: Vec<String>,
    },
}

impl CategorySummary {
    pub fn is_category(&self) -> bool {
        matches!(self, CategorySummary::Category { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Description {
    pub count: usize,
    /// The value itself when the group holds exactly one
    pub value: Option<JsonValue>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetGroup {
    pub asset_type: String,
    pub total: usize,
    pub offset: usize,
    pub asset_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifyResult {
    pub valid: bool,
    pub message: Option<String>,
}
