// Compiler soundness tests
//
// 컴파일된 SQL과 인터프리터가 같은 행을 선택하는지 속성 기반으로 검증

use datagrid_core::planner::{self, QueryRequest};
use datagrid_core::query::interpreter::sql_truth;
use datagrid_core::query::{Env, compile, evaluate, parse};
use datagrid_core::storage::sqlite;
use datagrid_core::{ColumnType, DataGrid, Schema, Value};
use indexmap::IndexMap;
use proptest::prelude::*;
use serde_json::json;
use std::path::PathBuf;
use std::sync::OnceLock;
use tempfile::TempDir;

// ─── Helpers ────────────────────────────────────────────

const RANGE: std::ops::RangeInclusive<i64> = -3..=3;

/// Values of the TEXT column, including some that look like JSON.
const TEXTS: &[&str] = &["[1, 2]", "abc", "", " pad ", "{\"k\": 1}", "AbC", "[x"];

/// Text literals the generator draws from.
const LITERALS: &[&str] = &["[1, ", " 2]", "ab", "a", " ", "", "{", "C"];

/// Every (A, B) pair in `RANGE`, each with one of `TEXTS`.
fn rows() -> Vec<(i64, i64, &'static str)> {
    RANGE
        .flat_map(|a| RANGE.map(move |b| (a, b)))
        .enumerate()
        .map(|(i, (a, b))| (a, b, TEXTS[i % TEXTS.len()]))
        .collect()
}

fn grid_path() -> &'static PathBuf {
    static GRID: OnceLock<(TempDir, PathBuf)> = OnceLock::new();
    let (_, path) = GRID.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pairs.datagrid");
        let mut grid = DataGrid::with_columns(
            "pairs",
            &[
                ("A", ColumnType::Integer),
                ("B", ColumnType::Integer),
                ("S", ColumnType::Text),
            ],
        )
        .unwrap();
        let rows = rows()
            .into_iter()
            .map(|(a, b, s)| vec![Value::Integer(a), Value::Integer(b), Value::Text(s.to_string())])
            .collect();
        grid.extend_values(rows).unwrap();
        grid.save(&path).unwrap();
        (dir, path)
    });
    path
}

fn interpreted_count(source: &str) -> usize {
    let expr = parse(source).unwrap();
    rows()
        .into_iter()
        .filter(|(a, b, s)| {
            let mut env = Env::new()
                .with_column("A", json!(a))
                .with_column("B", json!(b))
                .with_column("S", json!(s));
            sql_truth(&evaluate(&expr, &mut env).unwrap()) == Some(true)
        })
        .count()
}

fn compiled_count(source: &str) -> usize {
    let grid = DataGrid::open(grid_path()).unwrap();
    let conn = sqlite::open(grid_path()).unwrap();
    planner::select_query_count(&conn, grid.schema(), &QueryRequest::new().with_where(source))
        .unwrap()
}

fn select(options: &[&'static str]) -> impl Strategy<Value = &'static str> {
    prop::sample::select(options.to_vec())
}

fn text() -> BoxedStrategy<String> {
    let leaf = prop_oneof![
        Just("{'S'}".to_string()),
        select(LITERALS).prop_map(|s| format!("'{}'", s)),
    ];
    leaf.prop_recursive(2, 8, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(l, r)| format!("({} + {})", l, r)),
            (inner, select(&["upper", "lower", "strip"]))
                .prop_map(|(t, method)| format!("({}).{}()", t, method)),
        ]
    })
    .boxed()
}

fn number() -> BoxedStrategy<String> {
    let leaf = prop_oneof![
        3 => select(&["{'A'}", "{'B'}"]).prop_map(str::to_string),
        2 => (-5i64..=5).prop_map(|n| format!("({})", n)),
        1 => text().prop_map(|t| format!("len({})", t)),
    ];
    leaf.prop_recursive(3, 24, 3, |inner| {
        prop_oneof![
            (inner.clone(), select(&["+", "-", "*", "/", "//", "%"]), inner.clone())
                .prop_map(|(l, op, r)| format!("({} {} {})", l, op, r)),
            (inner.clone(), 0u32..=3).prop_map(|(base, exp)| format!("({} ** {})", base, exp)),
            (
                inner.clone(),
                select(&["abs", "round", "math.floor", "math.ceil", "math.sqrt"])
            )
                .prop_map(|(x, f)| format!("{}({})", f, x)),
            (inner.clone(), inner.clone(), inner.clone(), inner.clone())
                .prop_map(|(a, b, x, y)| format!("({} if {} < {} else {})", x, a, b, y)),
            inner.prop_map(|x| format!("(-{})", x)),
        ]
    })
    .boxed()
}

fn condition() -> impl Strategy<Value = String> {
    let leaf = prop_oneof![
        (number(), select(&["<", "<=", ">", ">=", "==", "!="]), number())
            .prop_map(|(l, op, r)| format!("({} {} {})", l, op, r)),
        (text(), select(&["==", "!=", "<"]), text())
            .prop_map(|(l, op, r)| format!("({} {} {})", l, op, r)),
        (text(), select(&["startswith", "endswith"]), text())
            .prop_map(|(t, method, arg)| format!("({}).{}({})", t, method, arg)),
        (text(), text()).prop_map(|(needle, hay)| format!("({} in {})", needle, hay)),
        (number(), select(&["in", "not in"]))
            .prop_map(|(n, op)| format!("({} {} [1, 2, -3, 0.5])", n, op)),
        number(),
    ];
    leaf.prop_recursive(2, 8, 2, |inner| {
        prop_oneof![
            (inner.clone(), select(&["and", "or"]), inner.clone())
                .prop_map(|(l, op, r)| format!("({} {} {})", l, op, r)),
            inner.prop_map(|e| format!("(not {})", e)),
        ]
    })
}

// ═══════════════════════════════════════════════════════════
// 속성 테스트
// ═══════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn test_compiled_filter_matches_interpreter(source in condition()) {
        prop_assert_eq!(compiled_count(&source), interpreted_count(&source), "{}", source);
    }
}

/// JSON처럼 보이는 TEXT도 문자열 함수에 그대로 전달
#[test]
fn test_json_looking_text_stays_text() {
    let with_prefix = "{'S'}.startswith('[1, ')";
    assert_eq!(compiled_count(with_prefix), interpreted_count(with_prefix));
    assert_eq!(compiled_count(with_prefix), 7);
    for source in [
        "{'S'}.endswith(' 2]')",
        "'[' in {'S'}",
        "'k' in {'S'}",
        "len({'S'}.split(',')) == 2",
        "{'S'}.strip().upper() == 'PAD'",
    ] {
        assert_eq!(compiled_count(source), interpreted_count(source), "{}", source);
        assert!(compiled_count(source) > 0, "{}", source);
    }
}

#[test]
fn test_known_filters_agree() {
    for source in [
        "{'A'} + {'B'} > 0",
        "{'A'} * {'B'} == 2 or {'A'} < -2",
        "not ({'A'} - {'B'})",
        "1 < {'A'} <= 3",
        "{'A'} // 2 == -2 or {'A'} % 2 == -1",
        "({'A'} / 2 if {'B'} > 0 else {'B'} ** 2) > 1",
        "round({'A'} / 2) in [0, 2]",
        "math.floor({'A'} / 2) == -2 and len({'S'}) > 0",
    ] {
        assert_eq!(compiled_count(source), interpreted_count(source), "{}", source);
    }
}

/// k개의 서로 다른 집계 → k개의 뷰, 각각 FROM에 한 번씩
#[test]
fn test_aggregate_extraction() {
    let mut schema = Schema::new();
    schema.add_column("A", ColumnType::Integer).unwrap();
    schema.add_column("B", ColumnType::Float).unwrap();

    let query = compile(
        Some("{'A'} > AVG({'A'}) and {'B'} < MAX({'B'}) and {'A'} != MIN({'A'})"),
        &IndexMap::new(),
        &schema,
    )
    .unwrap();
    assert_eq!(query.aggregates.len(), 3);
    let from = query.from_clause();
    let where_sql = query.where_sql.clone().unwrap();
    for view in query.aggregates.keys() {
        assert_eq!(from.matches(&format!("AS {}", view)).count(), 1, "{}", view);
        assert_eq!(where_sql.matches(view.as_str()).count(), 1, "{}", view);
    }

    let repeated = compile(
        Some("AVG({'A'}) > 0 and AVG({'A'}) < 10"),
        &IndexMap::new(),
        &schema,
    )
    .unwrap();
    assert_eq!(repeated.aggregates.len(), 1);
}

/// 집계 필터가 실제 그리드에서 실행됨
#[test]
fn test_aggregate_filter_executes() {
    assert_eq!(compiled_count("{'A'} > AVG({'A'})"), 21);
}
