//! # DataGrid Core — Embedded Multimedia Data Grid
//!
//! DataGrid는 타입이 지정된 행(row)과 이미지·임베딩 등의 에셋을 함께 저장하는
//! 임베디드 데이터 그리드입니다. 인메모리에서 스키마를 자유롭게 구성한 뒤,
//! 저장하면 하나의 SQLite 파일로 고정됩니다.
//!
//! ## 주요 특징
//!
//! - **타입 추론**: 값이 들어올 때 컬럼 타입을 추론하고 통합(unify)
//! - **에셋 저장소**: 콘텐츠 해시 기반 중복 제거, 썸네일, 메타데이터 스냅샷
//! - **표현식 질의**: Python 풍의 필터/계산 컬럼 표현식을 SQL로 컴파일
//! - **통계**: 컬럼별 min/max/avg/variance, JSON 키 경로, 임베딩 투영
//! - **요약**: group-by 기반 histogram / category / description / asset-group
//!
//! ## 빠른 시작
//!
//! ```rust
//! use datagrid_core::{DataGrid, Row, Value};
//!
//! # fn main() -> datagrid_core::DgResult<()> {
//! let mut grid = DataGrid::new("animals");
//!
//! let mut row = Row::new();
//! row.insert("name".to_string(), Value::Text("dog".to_string()));
//! row.insert("score".to_string(), Value::Float(0.9));
//! grid.append_row(row)?;
//!
//! assert_eq!(grid.row_count()?, 1);
//! assert_eq!(grid.column_names(), vec!["row-id", "name", "score"]);
//! # Ok(())
//! # }
//! ```
//!
//! ### 저장 후 질의
//!
//! ```rust,no_run
//! use datagrid_core::{DataGrid, QueryRequest, planner, storage::sqlite};
//!
//! # fn main() -> datagrid_core::DgResult<()> {
//! let grid = DataGrid::open("animals.datagrid")?;
//! let conn = sqlite::open("animals.datagrid")?;
//! let request = QueryRequest::new()
//!     .with_computed("double", "{score} * 2")
//!     .with_where("{double} > 1");
//! let page = planner::select_query_page(&conn, grid.schema(), &request, grid.context())?;
//! # Ok(())
//! # }
//! ```
//!
//! ## 아키텍처
//!
//! ```text
//! expression → Tokenizer → Parser → AST → Compiler → SQL fragments + views
//!           → Planner → SQLite (datagrid, metadata, assets, settings)
//!           → reshape → QueryPage / Histogram / CategorySummary / …
//! ```
//!
//! ## 모듈 구조
//!
//! - [`grid`] — 데이터 그리드 ([`DataGrid`])
//! - [`types`] — 컬럼 타입, 값, 스키마
//! - [`storage`] — SQLite 파일, 에셋 저장소, 캐시, 코덱
//! - [`query`] — 표현식 파서, 인터프리터, SQL 컴파일러
//! - [`planner`] — 페이지 질의와 그룹 요약
//! - [`stats`] — 컬럼 통계와 임베딩 투영
//! - [`api`] — HTTP 계층용 연산 façade

pub mod api;
pub mod config;
pub mod error;
pub mod grid;
pub mod planner;
pub mod query;
pub mod stats;
pub mod storage;
pub mod types;

// Logging utilities
pub mod logging;

// Re-export commonly used types
pub use config::{EngineConfig, EngineContext};
pub use error::{DgError, DgResult};
pub use grid::{ColumnSource, DataGrid};
pub use planner::{QueryPage, QueryRequest, SummaryRequest};
pub use storage::{Asset, AssetKind, AssetRegistry, LazyAsset};
pub use types::{ColumnType, Row, Schema, Value};
