//! Content-addressed asset table
//!
//! Rows reference assets by id; the bytes live once in `assets`. A bulk
//! operation logs through an [`AssetLogSession`] whose seen-id set is seeded
//! from the table, so an id is inserted at most once per operation and never
//! re-inserted across operations.

use crate::error::{DgError, DgResult};
use crate::storage::asset::{Asset, AssetPayload, AssetRegistry, Thumbnail};
use crate::storage::thumbnail::Thumbnailer;
use crate::types::Schema;
use ahash::AHashSet;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value as JsonValue;
use tracing::{debug, trace};

/// Collaborators needed to log assets.
pub struct LogOptions<'a> {
    pub registry: &'a AssetRegistry,
    pub thumbnailer: &'a dyn Thumbnailer,
    /// Rasterize thumbnails at log time instead of on first read
    pub pregenerate_thumbnails: bool,
}

/// Dedup scope of one bulk operation.
#[derive(Debug, Default)]
pub struct AssetLogSession {
    seen: AHashSet<String>,
    inserted: usize,
}

impl AssetLogSession {
    /// Starts a session seeded with the ids already stored.
    pub fn begin(conn: &Connection) -> DgResult<Self> {
        let mut stmt = conn.prepare("SELECT asset_id FROM assets")?;
        let seen = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<AHashSet<_>, _>>()?;
        Ok(Self { seen, inserted: 0 })
    }

    /// Inserts `asset` unless its id was already seen; returns the id.
    pub fn log(
        &mut self,
        conn: &Connection,
        asset: &Asset,
        options: &LogOptions<'_>,
    ) -> DgResult<String> {
        let id = asset.id().to_string();
        if self.seen.contains(&id) {
            trace!(asset_id = %id, "asset already stored");
            return Ok(id);
        }

        let kind = options.registry.lookup(asset.asset_type())?;
        let stored = match asset.payload() {
            AssetPayload::Bytes(bytes) => Some(kind.serialize(bytes, asset.metadata())?),
            AssetPayload::Source(_) => None,
        };
        let thumbnail = match asset.thumbnail() {
            Thumbnail::NotGenerated if options.pregenerate_thumbnails && kind.is_raster() => {
                let data = asset.data()?;
                match options
                    .thumbnailer
                    .thumbnail(asset.asset_type(), &data, asset.metadata())?
                {
                    Some(bytes) => Thumbnail::Bytes(bytes),
                    None => Thumbnail::UseOriginal,
                }
            }
            other => other.clone(),
        };

        conn.execute(
            "INSERT INTO assets (asset_id, asset_type, asset_data, asset_metadata, asset_thumbnail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                asset.asset_type(),
                stored,
                asset.metadata().to_string(),
                thumbnail_to_sql(&thumbnail),
            ],
        )?;
        self.seen.insert(id.clone());
        self.inserted += 1;
        Ok(id)
    }

    /// Rows inserted by this session.
    pub fn inserted(&self) -> usize {
        self.inserted
    }
}

fn thumbnail_to_sql(thumbnail: &Thumbnail) -> Option<Vec<u8>> {
    match thumbnail {
        Thumbnail::NotGenerated => None,
        Thumbnail::UseOriginal => Some(Vec::new()),
        Thumbnail::Bytes(bytes) => Some(bytes.clone()),
    }
}

fn thumbnail_from_sql(stored: Option<Vec<u8>>) -> Thumbnail {
    match stored {
        None => Thumbnail::NotGenerated,
        Some(bytes) if bytes.is_empty() => Thumbnail::UseOriginal,
        Some(bytes) => Thumbnail::Bytes(bytes),
    }
}

type StoredAsset = (String, Option<Vec<u8>>, Option<String>, Option<Vec<u8>>);

/// Reads and decodes one asset.
pub fn fetch_asset(conn: &Connection, id: &str, registry: &AssetRegistry) -> DgResult<Asset> {
    let row: Option<StoredAsset> = conn
        .query_row(
            "SELECT asset_type, asset_data, asset_metadata, asset_thumbnail
             FROM assets WHERE asset_id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    let (asset_type, data, metadata, thumbnail) =
        row.ok_or_else(|| DgError::AssetNotFound(id.to_string()))?;

    let metadata: JsonValue = match metadata {
        Some(text) => serde_json::from_str(&text)?,
        None => JsonValue::Null,
    };
    let payload = match data {
        Some(stored) => {
            let kind = registry.lookup(&asset_type)?;
            AssetPayload::Bytes(kind.deserialize(&stored, &metadata)?)
        }
        None => match metadata.get("source").and_then(JsonValue::as_str) {
            Some(uri) => AssetPayload::Source(uri.to_string()),
            None => return Err(DgError::AssetNotFound(id.to_string())),
        },
    };

    Ok(Asset::from_parts(
        id.to_string(),
        asset_type,
        payload,
        metadata,
        thumbnail_from_sql(thumbnail),
    ))
}

/// `(asset_type, payload bytes)`
pub fn asset_data(
    conn: &Connection,
    id: &str,
    registry: &AssetRegistry,
) -> DgResult<(String, Vec<u8>)> {
    let asset = fetch_asset(conn, id, registry)?;
    let data = asset.data()?;
    Ok((asset.asset_type().to_string(), data))
}

pub fn asset_metadata(conn: &Connection, id: &str) -> DgResult<JsonValue> {
    let text: Option<Option<String>> = conn
        .query_row(
            "SELECT asset_metadata FROM assets WHERE asset_id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    match text {
        Some(Some(text)) => Ok(serde_json::from_str(&text)?),
        Some(None) => Ok(JsonValue::Null),
        None => Err(DgError::AssetNotFound(id.to_string())),
    }
}

/// Thumbnail bytes, generated on the fly when not stored.
///
/// Generated thumbnails are not written back.
pub fn asset_thumbnail(
    conn: &Connection,
    id: &str,
    registry: &AssetRegistry,
    thumbnailer: &dyn Thumbnailer,
) -> DgResult<Vec<u8>> {
    let asset = fetch_asset(conn, id, registry)?;
    match asset.thumbnail() {
        Thumbnail::Bytes(bytes) => Ok(bytes.clone()),
        Thumbnail::UseOriginal => asset.data(),
        Thumbnail::NotGenerated => {
            let data = asset.data()?;
            let raster = registry
                .get(asset.asset_type())
                .is_some_and(|kind| kind.is_raster());
            if !raster {
                return Ok(data);
            }
            Ok(thumbnailer
                .thumbnail(asset.asset_type(), &data, asset.metadata())?
                .unwrap_or(data))
        }
    }
}

/// Replaces an asset's stored metadata document.
pub fn update_metadata(conn: &Connection, id: &str, metadata: &JsonValue) -> DgResult<()> {
    let changed = conn.execute(
        "UPDATE assets SET asset_metadata = ?1 WHERE asset_id = ?2",
        params![metadata.to_string(), id],
    )?;
    if changed == 0 {
        return Err(DgError::AssetNotFound(id.to_string()));
    }
    Ok(())
}

pub fn asset_count(conn: &Connection) -> DgResult<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM assets", [], |row| row.get(0))?;
    Ok(count as usize)
}

/// Deletes assets no asset column references; returns how many.
pub fn delete_orphaned(conn: &Connection, schema: &Schema) -> DgResult<usize> {
    let referenced: Vec<String> = schema
        .asset_columns()
        .map(|c| {
            format!(
                "SELECT {0} FROM datagrid WHERE {0} IS NOT NULL",
                c.field_name
            )
        })
        .collect();
    let sql = if referenced.is_empty() {
        "DELETE FROM assets".to_string()
    } else {
        format!(
            "DELETE FROM assets WHERE asset_id NOT IN ({})",
            referenced.join(" UNION ")
        )
    };
    let deleted = conn.execute(&sql, [])?;
    debug!(deleted, "orphaned assets removed");
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::sqlite;
    use crate::storage::thumbnail::{PpmThumbnailer, Raster};
    use serde_json::json;

    fn setup() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = sqlite::create(dir.path().join("a.datagrid"), &Schema::new()).unwrap();
        (dir, conn)
    }

    #[test]
    fn test_log_dedups_within_session() {
        let (_dir, conn) = setup();
        let registry = AssetRegistry::default();
        let thumbnailer = PpmThumbnailer::default();
        let options = LogOptions {
            registry: &registry,
            thumbnailer: &thumbnailer,
            pregenerate_thumbnails: false,
        };

        let asset = Asset::new("Text", b"hello".to_vec());
        let mut session = AssetLogSession::begin(&conn).unwrap();
        let first = session.log(&conn, &asset, &options).unwrap();
        let second = session.log(&conn, &asset, &options).unwrap();
        assert_eq!(first, second);
        assert_eq!(session.inserted(), 1);
        assert_eq!(asset_count(&conn).unwrap(), 1);

        // 새 세션도 기존 id를 안다
        let mut session = AssetLogSession::begin(&conn).unwrap();
        session.log(&conn, &asset, &options).unwrap();
        assert_eq!(session.inserted(), 0);
    }

    #[test]
    fn test_fetch_round_trip_and_thumbnail_states() {
        let (_dir, conn) = setup();
        let registry = AssetRegistry::default();
        let thumbnailer = PpmThumbnailer::new(4, 4);
        let options = LogOptions {
            registry: &registry,
            thumbnailer: &thumbnailer,
            pregenerate_thumbnails: true,
        };

        let small = Asset::new("Image", Raster::filled(2, 2, [1, 2, 3]).encode_ppm());
        let large = Asset::new("Image", Raster::filled(8, 8, [1, 2, 3]).encode_ppm());
        let text = Asset::new("Text", b"t".to_vec()).with_metadata(json!({"lang": "en"}));
        let mut session = AssetLogSession::begin(&conn).unwrap();
        for asset in [&small, &large, &text] {
            session.log(&conn, asset, &options).unwrap();
        }

        let back = fetch_asset(&conn, small.id(), &registry).unwrap();
        assert_eq!(back.thumbnail(), &Thumbnail::UseOriginal);
        assert_eq!(back.data().unwrap(), small.data().unwrap());

        let back = fetch_asset(&conn, large.id(), &registry).unwrap();
        assert!(matches!(back.thumbnail(), Thumbnail::Bytes(_)));

        let back = fetch_asset(&conn, text.id(), &registry).unwrap();
        assert_eq!(back.thumbnail(), &Thumbnail::NotGenerated);
        assert_eq!(back.metadata()["lang"], json!("en"));
        assert_eq!(asset_thumbnail(&conn, text.id(), &registry, &thumbnailer).unwrap(), b"t");
    }

    #[test]
    fn test_missing_asset() {
        let (_dir, conn) = setup();
        let registry = AssetRegistry::default();
        assert!(fetch_asset(&conn, "nope", &registry).unwrap_err().is_not_found());
        assert!(asset_metadata(&conn, "nope").unwrap_err().is_not_found());
        assert!(update_metadata(&conn, "nope", &json!({})).is_err());
    }

    #[test]
    fn test_source_backed_asset() {
        let (dir, conn) = setup();
        let registry = AssetRegistry::default();
        let thumbnailer = PpmThumbnailer::default();
        let options = LogOptions {
            registry: &registry,
            thumbnailer: &thumbnailer,
            pregenerate_thumbnails: false,
        };
        let file = dir.path().join("clip.wav");
        std::fs::write(&file, b"RIFF").unwrap();

        let asset = Asset::from_source("Audio", file.to_str().unwrap());
        AssetLogSession::begin(&conn)
            .unwrap()
            .log(&conn, &asset, &options)
            .unwrap();
        let (kind, data) = asset_data(&conn, asset.id(), &registry).unwrap();
        assert_eq!(kind, "Audio");
        assert_eq!(data, b"RIFF");
    }
}
