//! Query planner and executor
//!
//! 요청(QueryRequest / SummaryRequest)을 SQL로 컴파일하여 그리드 파일에서 실행하고,
//! 결과를 클라이언트가 읽는 JSON 형태로 재구성합니다.
//!
//! ```text
//! request → compile (WHERE + computed + aggregate views)
//!         → SELECT … FROM datagrid, views … → reshape → page / summary
//! ```

mod gallery;
mod page;
mod summary;
mod types;

pub use gallery::{select_asset_group, select_asset_group_metadata, select_asset_group_thumbnail};
pub use page::{select_query_count, select_query_page};
pub use summary::{
    COMMA_ESCAPE, categorize, group_concat_sql, histogram, histogram_json, select_category,
    select_description, select_histogram, split_group_values,
};
pub use types::{
    AssetGroup, CategorySummary, Description, Histogram, HistogramBin, QueryPage, QueryRequest,
    SummaryRequest, VerifyResult,
};

use crate::config::EngineContext;
use crate::error::{DgError, DgResult};
use crate::query;
use crate::stats::{self, ColumnMetadata};
use crate::storage::asset::AssetRegistry;
use crate::storage::asset_store;
use crate::storage::thumbnail::Thumbnailer;
use crate::types::{ColumnType, Schema};
use indexmap::IndexMap;
use rusqlite::{Connection, Statement};
use tracing::debug;

pub(crate) fn execute_error(err: rusqlite::Error, sql: &str) -> DgError {
    DgError::execution(err, sql)
}

/// Prepares compiled SQL, reporting failures as execution errors.
pub(crate) fn prepare<'c>(conn: &'c Connection, sql: &str) -> DgResult<Statement<'c>> {
    conn.prepare(sql).map_err(|e| execute_error(e, sql))
}

/// Summary endpoint a `row-group` reference points at.
pub(crate) fn endpoint_for(column_type: Option<&ColumnType>) -> &'static str {
    match column_type {
        Some(
            ColumnType::Integer | ColumnType::Float | ColumnType::Datetime | ColumnType::RowId,
        ) => "histogram",
        Some(ColumnType::Boolean | ColumnType::Text) => "category",
        Some(ColumnType::Asset(_)) => "asset-group",
        Some(ColumnType::Json | ColumnType::Vector) | None => "description",
    }
}

/// Column catalog with statistics, recomputing any that were invalidated.
pub fn select_metadata(
    conn: &Connection,
    schema: &Schema,
    context: &EngineContext,
) -> DgResult<IndexMap<String, ColumnMetadata>> {
    let refreshed = stats::ensure_statistics(conn, schema, context)?;
    if refreshed > 0 {
        debug!(refreshed, "statistics recomputed");
    }
    stats::catalog(conn)
}

/// Column name → JSON key paths usable after `{column}` in expressions.
pub fn select_completions(
    conn: &Connection,
    schema: &Schema,
    context: &EngineContext,
) -> DgResult<IndexMap<String, Vec<String>>> {
    let catalog = select_metadata(conn, schema, context)?;
    Ok(schema
        .visible_columns()
        .filter_map(|column| {
            let completions = catalog.get(&column.name)?.statistics.completions();
            (!completions.is_empty()).then(|| (column.name.clone(), completions))
        })
        .collect())
}

/// `(asset_type, bytes)` of an asset or of its thumbnail.
pub fn select_asset(
    conn: &Connection,
    asset_id: &str,
    registry: &AssetRegistry,
    thumbnailer: &dyn Thumbnailer,
    thumbnail: bool,
) -> DgResult<(String, Vec<u8>)> {
    if thumbnail {
        let asset = asset_store::fetch_asset(conn, asset_id, registry)?;
        let bytes = asset_store::asset_thumbnail(conn, asset_id, registry, thumbnailer)?;
        Ok((asset.asset_type().to_string(), bytes))
    } else {
        asset_store::asset_data(conn, asset_id, registry)
    }
}

/// Compile-only check of a filter; never touches the grid's rows.
pub fn verify_where(
    where_expr: &str,
    computed_columns: &IndexMap<String, String>,
    schema: &Schema,
) -> VerifyResult {
    match query::verify_where(where_expr, computed_columns, schema) {
        Ok(()) => VerifyResult {
            valid: true,
            message: None,
        },
        Err(err) => VerifyResult {
            valid: false,
            message: Some(err.to_string()),
        },
    }
}
