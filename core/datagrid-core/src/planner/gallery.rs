//! Asset groups: the assets of one column within one group of rows

use super::summary::{GroupValues, group_values};
use super::types::{AssetGroup, SummaryRequest};
use crate::config::EngineContext;
use crate::error::{DgError, DgResult};
use crate::storage::asset::annotation_summary;
use crate::storage::asset_store;
use crate::types::Schema;
use ahash::{AHashMap, AHashSet};
use rusqlite::Connection;
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};

/// Group values of an asset column; anything else is rejected.
fn asset_values(
    conn: &Connection,
    schema: &Schema,
    request: &SummaryRequest,
) -> DgResult<(String, Vec<String>)> {
    let GroupValues {
        column_type,
        values,
    } = group_values(conn, schema, request)?;
    match column_type.as_ref().and_then(|t| t.asset_kind()) {
        Some(kind) => Ok((kind.to_string(), values)),
        None => Err(DgError::InvalidArguments(format!(
            "column '{}' does not hold assets",
            request.column_name
        ))),
    }
}

/// Ids in first-seen order, duplicates dropped.
fn distinct(ids: Vec<String>) -> Vec<String> {
    let mut seen = AHashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// One page of the distinct assets in a group.
#[instrument(skip_all, fields(column = %request.column_name, offset = offset))]
pub fn select_asset_group(
    conn: &Connection,
    schema: &Schema,
    request: &SummaryRequest,
    offset: usize,
    limit: Option<usize>,
    context: &EngineContext,
) -> DgResult<AssetGroup> {
    let (asset_type, ids) = asset_values(conn, schema, request)?;
    let ids = distinct(ids);
    let limit = limit.unwrap_or(context.config.default_page_size);
    Ok(AssetGroup {
        asset_type,
        total: ids.len(),
        offset,
        asset_ids: ids.into_iter().skip(offset).take(limit).collect(),
    })
}

/// Label counts and score ranges over the annotations of every row in the
/// group; an asset shared by several rows counts once per row.
pub fn select_asset_group_metadata(
    conn: &Connection,
    schema: &Schema,
    request: &SummaryRequest,
) -> DgResult<JsonValue> {
    let (_, ids) = asset_values(conn, schema, request)?;
    let mut loaded: AHashMap<String, JsonValue> = AHashMap::new();
    let mut documents = Vec::with_capacity(ids.len());
    for id in ids {
        let metadata = match loaded.get(&id) {
            Some(metadata) => metadata.clone(),
            None => {
                let metadata = asset_store::asset_metadata(conn, &id)?;
                loaded.insert(id, metadata.clone());
                metadata
            }
        };
        documents.push(metadata);
    }
    Ok(annotation_summary(documents.iter()))
}

/// Gallery image of the group's first distinct assets.
#[instrument(skip_all, fields(column = %request.column_name))]
pub fn select_asset_group_thumbnail(
    conn: &Connection,
    schema: &Schema,
    request: &SummaryRequest,
    context: &EngineContext,
) -> DgResult<Vec<u8>> {
    let (_, ids) = asset_values(conn, schema, request)?;
    let layout = &context.config.gallery;
    let tiles = distinct(ids)
        .into_iter()
        .take(layout.capacity())
        .map(|id| {
            asset_store::asset_thumbnail(
                conn,
                &id,
                &context.registry,
                context.thumbnailer.as_ref(),
            )
        })
        .collect::<DgResult<Vec<_>>>()?;
    debug!(tiles = tiles.len(), "composing gallery");
    context.thumbnailer.compose(layout, &tiles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::tests::fixture;
    use crate::storage::sqlite;
    use crate::storage::thumbnail::Raster;
    use serde_json::json;

    #[test]
    fn test_asset_group_dedups_and_pages() {
        let (_dir, grid) = fixture();
        let conn = sqlite::open(grid.path().unwrap()).unwrap();
        let request = SummaryRequest::new("img").in_group("name", json!("dog"));

        let group = select_asset_group(&conn, grid.schema(), &request, 0, None, grid.context())
            .unwrap();
        assert_eq!(group.asset_type, "Image");
        assert_eq!(group.total, 2);
        assert_eq!(group.asset_ids.len(), 2);

        let page = select_asset_group(&conn, grid.schema(), &request, 1, Some(5), grid.context())
            .unwrap();
        assert_eq!(page.asset_ids, group.asset_ids[1..].to_vec());
    }

    #[test]
    fn test_asset_group_rejects_plain_columns() {
        let (_dir, grid) = fixture();
        let conn = sqlite::open(grid.path().unwrap()).unwrap();
        let request = SummaryRequest::new("score");
        assert!(matches!(
            select_asset_group(&conn, grid.schema(), &request, 0, None, grid.context()),
            Err(DgError::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_asset_group_metadata() {
        let (_dir, grid) = fixture();
        let conn = sqlite::open(grid.path().unwrap()).unwrap();
        let request = SummaryRequest::new("img").in_group("name", json!("dog"));
        let summary = select_asset_group_metadata(&conn, grid.schema(), &request).unwrap();
        assert_eq!(summary["labels"]["dog"], json!(3));
        assert_eq!(summary["scores"]["dog"], json!([0.7, 0.9]));
    }

    #[test]
    fn test_asset_group_thumbnail() {
        let (_dir, grid) = fixture();
        let conn = sqlite::open(grid.path().unwrap()).unwrap();
        let bytes = select_asset_group_thumbnail(
            &conn,
            grid.schema(),
            &SummaryRequest::new("img"),
            grid.context(),
        )
        .unwrap();
        let gallery = Raster::decode_ppm(&bytes).unwrap();
        let (width, height) = grid.context().config.gallery.canvas_size();
        assert_eq!((gallery.width, gallery.height), (width, height));
    }
}
