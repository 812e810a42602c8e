//! API 모듈 — HTTP 계층이 호출하는 연산 façade
//!
//! 모든 연산은 [`EngineContext`]와 DGID를 받아 그리드 파일을 열고, 자체 연결
//! 위에서 하나의 질의를 수행합니다. 직렬화 가능한 결과만 반환합니다.
//!
//! ```rust,no_run
//! use datagrid_core::{EngineContext, QueryRequest, api};
//!
//! # fn main() -> datagrid_core::DgResult<()> {
//! let ctx = EngineContext::from_env();
//! let page = api::query_page(&ctx, "animals", &QueryRequest::new().with_where("{score} > 1"))?;
//! println!("{} rows", page.nrows);
//! # Ok(())
//! # }
//! ```

pub mod dgid;

pub use dgid::{GridEntry, list, resolve};

use crate::config::EngineContext;
use crate::error::DgResult;
use crate::grid::DataGrid;
use crate::planner::{
    self, AssetGroup, CategorySummary, Description, Histogram, QueryPage, QueryRequest,
    SummaryRequest, VerifyResult,
};
use crate::stats::ColumnMetadata;
use crate::storage::sqlite;
use indexmap::IndexMap;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::fs;
use tracing::instrument;

/// Opens the grid behind `dgid` together with a fresh connection.
fn open(context: &EngineContext, dgid: &str) -> DgResult<(DataGrid, Connection)> {
    let path = resolve(context, dgid)?;
    let grid = DataGrid::open_with_context(&path, context.clone())?;
    let conn = sqlite::open(&path)?;
    Ok((grid, conn))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Total {
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Timestamp {
    pub timestamp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub version: &'static str,
    pub root: String,
    pub grids: usize,
    pub cache_entries: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

// ════════════════════════════════════════════
// Rows
// ════════════════════════════════════════════

#[instrument(skip(context, request))]
pub fn query_page(
    context: &EngineContext,
    dgid: &str,
    request: &QueryRequest,
) -> DgResult<QueryPage> {
    let (grid, conn) = open(context, dgid)?;
    planner::select_query_page(&conn, grid.schema(), request, context)
}

pub fn query_total(
    context: &EngineContext,
    dgid: &str,
    request: &QueryRequest,
) -> DgResult<Total> {
    let (grid, conn) = open(context, dgid)?;
    let total = planner::select_query_count(&conn, grid.schema(), request)?;
    Ok(Total { total })
}

// ════════════════════════════════════════════
// Group summaries
// ════════════════════════════════════════════

#[instrument(skip(context, request))]
pub fn histogram(
    context: &EngineContext,
    dgid: &str,
    request: &SummaryRequest,
) -> DgResult<Histogram> {
    let (grid, conn) = open(context, dgid)?;
    planner::select_histogram(&conn, grid.schema(), request, context)
}

pub fn category(
    context: &EngineContext,
    dgid: &str,
    request: &SummaryRequest,
) -> DgResult<CategorySummary> {
    let (grid, conn) = open(context, dgid)?;
    planner::select_category(&conn, grid.schema(), request, context)
}

pub fn description(
    context: &EngineContext,
    dgid: &str,
    request: &SummaryRequest,
) -> DgResult<Description> {
    let (grid, conn) = open(context, dgid)?;
    planner::select_description(&conn, grid.schema(), request)
}

pub fn asset_group(
    context: &EngineContext,
    dgid: &str,
    request: &SummaryRequest,
    offset: usize,
    limit: Option<usize>,
) -> DgResult<AssetGroup> {
    let (grid, conn) = open(context, dgid)?;
    planner::select_asset_group(&conn, grid.schema(), request, offset, limit, context)
}

pub fn asset_group_metadata(
    context: &EngineContext,
    dgid: &str,
    request: &SummaryRequest,
) -> DgResult<JsonValue> {
    let (grid, conn) = open(context, dgid)?;
    planner::select_asset_group_metadata(&conn, grid.schema(), request)
}

/// Gallery image bytes.
pub fn asset_group_thumbnail(
    context: &EngineContext,
    dgid: &str,
    request: &SummaryRequest,
) -> DgResult<Vec<u8>> {
    let (grid, conn) = open(context, dgid)?;
    planner::select_asset_group_thumbnail(&conn, grid.schema(), request, context)
}

// ════════════════════════════════════════════
// Downloads
// ════════════════════════════════════════════

/// `(asset_type, bytes)` of an asset or its thumbnail.
pub fn download_asset(
    context: &EngineContext,
    dgid: &str,
    asset_id: &str,
    thumbnail: bool,
) -> DgResult<(String, Vec<u8>)> {
    let path = resolve(context, dgid)?;
    let conn = sqlite::open(&path)?;
    planner::select_asset(
        &conn,
        asset_id,
        &context.registry,
        context.thumbnailer.as_ref(),
        thumbnail,
    )
}

/// The grid file itself.
pub fn download_grid(context: &EngineContext, dgid: &str) -> DgResult<Vec<u8>> {
    let path = resolve(context, dgid)?;
    Ok(fs::read(path)?)
}

// ════════════════════════════════════════════
// Catalog
// ════════════════════════════════════════════

pub fn metadata(
    context: &EngineContext,
    dgid: &str,
) -> DgResult<IndexMap<String, ColumnMetadata>> {
    let (grid, conn) = open(context, dgid)?;
    planner::select_metadata(&conn, grid.schema(), context)
}

pub fn verify_where(
    context: &EngineContext,
    dgid: &str,
    where_expr: &str,
    computed_columns: &IndexMap<String, String>,
) -> DgResult<VerifyResult> {
    let path = resolve(context, dgid)?;
    let grid = DataGrid::open_with_context(&path, context.clone())?;
    Ok(planner::verify_where(where_expr, computed_columns, grid.schema()))
}

pub fn completions(
    context: &EngineContext,
    dgid: &str,
) -> DgResult<IndexMap<String, Vec<String>>> {
    let (grid, conn) = open(context, dgid)?;
    planner::select_completions(&conn, grid.schema(), context)
}

/// Modification time of the grid file, for client-side cache busting.
pub fn timestamp(context: &EngineContext, dgid: &str) -> DgResult<Timestamp> {
    let path = resolve(context, dgid)?;
    Ok(Timestamp {
        timestamp: dgid::modified_seconds(&path)?,
    })
}

pub fn status(context: &EngineContext) -> DgResult<Status> {
    let cache = context.cache.stats();
    Ok(Status {
        version: env!("CARGO_PKG_VERSION"),
        root: context.root().display().to_string(),
        grids: list(context)?.len(),
        cache_entries: cache.entries,
        cache_hits: cache.hits,
        cache_misses: cache.misses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::types::{Row, Value};
    use serde_json::json;

    fn root_with_grid() -> (tempfile::TempDir, EngineContext) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = EngineContext::new(EngineConfig::new(dir.path()));
        let mut grid = DataGrid::new("numbers").with_context(ctx.clone());
        grid.extend(
            (1..=5)
                .map(|i| {
                    let mut row = Row::new();
                    row.insert("n".to_string(), Value::Integer(i));
                    row.insert(
                        "parity".to_string(),
                        Value::Text(if i % 2 == 0 { "even" } else { "odd" }.to_string()),
                    );
                    row
                })
                .collect(),
        )
        .unwrap();
        grid.save(dir.path().join("numbers.datagrid")).unwrap();
        (dir, ctx)
    }

    #[test]
    fn test_query_endpoints() {
        let (_dir, ctx) = root_with_grid();
        let request = QueryRequest::new().with_where("{n} >= 3");
        assert_eq!(query_total(&ctx, "numbers", &request).unwrap().total, 3);
        let page = query_page(&ctx, "numbers", &request.with_limit(1)).unwrap();
        assert_eq!(page.rows[0]["n"], json!(3));
    }

    #[test]
    fn test_summary_endpoints() {
        let (_dir, ctx) = root_with_grid();
        let h = histogram(&ctx, "numbers", &SummaryRequest::new("n")).unwrap();
        assert_eq!(h.count, 5);
        let c = category(&ctx, "numbers", &SummaryRequest::new("parity")).unwrap();
        assert!(c.is_category());
        let d = description(
            &ctx,
            "numbers",
            &SummaryRequest::new("n").in_group("parity", json!("even")),
        )
        .unwrap();
        assert_eq!(d.count, 2);
        assert_eq!(d.text, "2 values");
    }

    #[test]
    fn test_catalog_endpoints() {
        let (_dir, ctx) = root_with_grid();
        let catalog = metadata(&ctx, "numbers").unwrap();
        assert_eq!(catalog["n"].statistics.maximum, Some(5.0));
        assert!(verify_where(&ctx, "numbers", "{n} > 1", &IndexMap::new()).unwrap().valid);
        assert!(!verify_where(&ctx, "numbers", "{m} > 1", &IndexMap::new()).unwrap().valid);
        assert!(timestamp(&ctx, "numbers").unwrap().timestamp > 0.0);
        assert!(!download_grid(&ctx, "numbers.datagrid").unwrap().is_empty());
        assert_eq!(status(&ctx).unwrap().grids, 1);
    }

    #[test]
    fn test_missing_grid_is_not_found() {
        let (_dir, ctx) = root_with_grid();
        let err = query_page(&ctx, "absent", &QueryRequest::new()).unwrap_err();
        assert!(err.is_not_found());
        assert!(download_asset(&ctx, "numbers", "nope", false).unwrap_err().is_not_found());
    }
}
