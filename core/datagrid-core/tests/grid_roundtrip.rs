// Grid lifecycle tests
//
// 인메모리 → 저장 → 재로드 → 변경 전 과정의 종단 간 검증

use datagrid_core::storage::{AssetState, asset_store, sqlite};
use datagrid_core::{Asset, ColumnSource, ColumnType, DataGrid, DgError, DgResult, Row, Value};
use serde_json::json;
use tempfile::tempdir;

// ─── Helpers ────────────────────────────────────────────

fn row(pairs: Vec<(&str, Value)>) -> Row {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn photo(seed: u8) -> Asset {
    Asset::new("Image", vec![seed; 16]).with_metadata(json!({"seed": seed}))
}

// ═══════════════════════════════════════════════════════════
// 저장 / 재로드
// ═══════════════════════════════════════════════════════════

#[test]
fn test_save_reload_preserves_rows_and_types() -> DgResult<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("mixed.datagrid");
    let mut grid = DataGrid::new("mixed").with_about("round trip");
    grid.extend(vec![
        row(vec![
            ("flag", Value::Boolean(true)),
            ("count", Value::Integer(3)),
            ("ratio", Value::Float(0.5)),
            ("label", Value::Text("a".to_string())),
            ("doc", Value::Json(json!({"k": [1, 2]}))),
        ]),
        row(vec![
            ("flag", Value::Boolean(false)),
            ("count", Value::Null),
            ("ratio", Value::Integer(2)),
            ("label", Value::Text("b".to_string())),
            ("doc", Value::Null),
        ]),
    ])?;
    let before = grid.rows()?;
    grid.save(&path)?;

    let reopened = DataGrid::open(&path)?;
    assert_eq!(reopened.name(), "mixed");
    assert_eq!(reopened.about(), Some("round trip"));
    assert_eq!(reopened.schema().column_type("ratio"), Some(&ColumnType::Float));
    assert_eq!(reopened.rows()?, before);
    Ok(())
}

#[test]
fn test_on_disk_schema_is_frozen() -> DgResult<()> {
    let dir = tempdir().unwrap();
    let mut grid = DataGrid::with_columns("frozen", &[("x", ColumnType::Integer)])?;
    grid.append_row(row(vec![("x", Value::Integer(1))]))?;
    grid.save(dir.path().join("frozen.datagrid"))?;

    let err = grid.append_row(row(vec![("y", Value::Integer(2))])).unwrap_err();
    assert!(matches!(err, DgError::Schema(_)));
    assert_eq!(grid.row_count()?, 1);

    grid.append_row(row(vec![("x", Value::Integer(2))]))?;
    assert_eq!(grid.row_count()?, 2);
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// 에셋
// ═══════════════════════════════════════════════════════════

/// 같은 콘텐츠는 여러 번 추가해도 한 번만 저장
#[test]
fn test_asset_dedup_across_extends() -> DgResult<()> {
    let dir = tempdir().unwrap();
    let mut grid = DataGrid::new("photos");
    grid.append_row(row(vec![("img", Value::Asset(photo(1)))]))?;
    grid.save(dir.path().join("photos.datagrid"))?;

    grid.extend(vec![
        row(vec![("img", Value::Asset(photo(1)))]),
        row(vec![("img", Value::Asset(photo(2)))]),
        row(vec![("img", Value::Asset(photo(2)))]),
    ])?;

    let conn = sqlite::open(grid.path().unwrap())?;
    assert_eq!(asset_store::asset_count(&conn)?, 2);
    assert_eq!(grid.row_count()?, 4);

    let rows = grid.rows()?;
    let id = rows[0]["img"].asset_id().unwrap().to_string();
    assert_eq!(rows[1]["img"].asset_id(), Some(id.as_str()));

    let mut lazy = grid.asset(&id)?;
    assert!(matches!(lazy.state(), AssetState::Unloaded));
    assert_eq!(lazy.metadata()?["seed"], json!(1));
    assert!(lazy.is_loaded());
    assert_eq!(grid.asset_data(&id)?, ("Image".to_string(), vec![1; 16]));
    Ok(())
}

/// 에셋 컬럼은 id와 디코딩된 데이터로 비교
#[test]
fn test_asset_column_save_reload() -> DgResult<()> {
    let dir = tempdir().unwrap();
    let path = dir.path().join("album.datagrid");
    let mut grid = DataGrid::new("album");
    grid.extend(
        (1u8..=3)
            .map(|i| {
                row(vec![
                    ("img", Value::Asset(photo(i))),
                    ("n", Value::Integer(i64::from(i))),
                ])
            })
            .collect(),
    )?;
    assert_eq!(grid.schema().column_type("img"), Some(&ColumnType::asset("Image")));

    let before = grid
        .rows()?
        .iter()
        .map(|r| -> DgResult<(String, (String, Vec<u8>))> {
            assert!(matches!(r["img"], Value::Asset(_)));
            let id = r["img"].asset_id().unwrap().to_string();
            let data = grid.asset_data(&id)?;
            Ok((id, data))
        })
        .collect::<DgResult<Vec<_>>>()?;
    grid.save(&path)?;

    let reopened = DataGrid::open(&path)?;
    assert_eq!(reopened.schema().column_type("img"), Some(&ColumnType::asset("Image")));
    let rows = reopened.rows()?;
    assert_eq!(rows.len(), before.len());
    for (row, (id, data)) in rows.iter().zip(&before) {
        assert!(matches!(row["img"], Value::AssetRef { .. }));
        assert_eq!(row["img"].asset_id(), Some(id.as_str()));
        assert_eq!(&reopened.asset_data(id)?, data);
    }
    assert_eq!(before[2].1, ("Image".to_string(), vec![3; 16]));
    Ok(())
}

/// 트랜잭션 안에서 실패한 배치는 아무것도 남기지 않음
#[test]
fn test_failed_batch_rolls_back() -> DgResult<()> {
    let dir = tempdir().unwrap();
    let mut grid = DataGrid::new("photos");
    grid.append_row(row(vec![("img", Value::Asset(photo(1)))]))?;
    grid.save(dir.path().join("photos.datagrid"))?;

    let err = grid
        .extend(vec![
            row(vec![("img", Value::Asset(photo(2)))]),
            row(vec![(
                "img",
                Value::AssetRef {
                    asset_type: "Image".to_string(),
                    asset_id: "0".repeat(64),
                },
            )]),
        ])
        .unwrap_err();
    assert!(matches!(err, DgError::AssetNotFound(_)));

    assert_eq!(grid.row_count()?, 1);
    let conn = sqlite::open(grid.path().unwrap())?;
    assert_eq!(asset_store::asset_count(&conn)?, 1);

    grid.append_row(row(vec![("img", Value::Asset(photo(2)))]))?;
    let ids: Vec<_> = grid.rows()?.iter().map(|r| r["row-id"].clone()).collect();
    assert_eq!(ids, vec![Value::Integer(1), Value::Integer(2)]);
    assert_eq!(asset_store::asset_count(&conn)?, 2);
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// 변경
// ═══════════════════════════════════════════════════════════

#[test]
fn test_remove_rows_renumbers_and_drops_orphans() -> DgResult<()> {
    let dir = tempdir().unwrap();
    let mut grid = DataGrid::new("photos");
    grid.extend((1u8..=4).map(|i| row(vec![("img", Value::Asset(photo(i)))])).collect())?;
    grid.save(dir.path().join("photos.datagrid"))?;

    grid.remove_rows(&[1, 3])?;

    let rows = grid.rows()?;
    let ids: Vec<_> = rows.iter().map(|r| r["row-id"].clone()).collect();
    assert_eq!(ids, vec![Value::Integer(1), Value::Integer(2)]);
    let conn = sqlite::open(grid.path().unwrap())?;
    assert_eq!(asset_store::asset_count(&conn)?, 2);
    Ok(())
}

#[test]
fn test_append_expression_column() -> DgResult<()> {
    let dir = tempdir().unwrap();
    let mut grid = DataGrid::with_columns("n", &[("n", ColumnType::Integer)])?;
    grid.extend_values((1..=4).map(|i| vec![Value::Integer(i)]).collect())?;

    let err = grid
        .append_column("sq", ColumnSource::Expression("{'n'} * {'n'}".to_string()), None)
        .unwrap_err();
    assert!(matches!(err, DgError::Mode { .. }));

    grid.save(dir.path().join("n.datagrid"))?;
    grid.append_column("sq", ColumnSource::Expression("{'n'} * {'n'}".to_string()), None)?;

    assert_eq!(grid.schema().column_type("sq"), Some(&ColumnType::Integer));
    let squares: Vec<_> = grid.rows()?.iter().map(|r| r["sq"].clone()).collect();
    assert_eq!(
        squares,
        vec![Value::Integer(1), Value::Integer(4), Value::Integer(9), Value::Integer(16)]
    );
    Ok(())
}

#[test]
fn test_append_value_column_checks_length() -> DgResult<()> {
    let mut grid = DataGrid::with_columns("n", &[("n", ColumnType::Integer)])?;
    grid.extend_values(vec![vec![Value::Integer(1)], vec![Value::Integer(2)]])?;

    assert!(grid
        .append_column("tag", ColumnSource::Values(vec![Value::Text("x".to_string())]), None)
        .is_err());
    grid.append_column(
        "tag",
        ColumnSource::Values(vec![Value::Text("x".to_string()), Value::Null]),
        None,
    )?;
    assert_eq!(grid.schema().column_type("tag"), Some(&ColumnType::Text));
    assert_eq!(grid.rows()?[1]["tag"], Value::Null);
    Ok(())
}
