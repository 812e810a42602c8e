//! DataGrid — typed rows in memory or in a SQLite file
//!
//! A grid starts in memory with a mutable schema. [`DataGrid::save`] freezes
//! the schema, writes the rows and assets to disk and switches the grid to
//! on-disk mode for good; from then on every operation goes through a fresh
//! connection to the file.
//!
//! The implementation is split by concern:
//! - `ingest` — batch validation and type inference for `extend`
//! - `persist` — save, row writing and reading
//! - `mutate` — column/row removal and `append_column`

mod ingest;
mod mutate;
mod persist;

use crate::config::EngineContext;
use crate::error::{DgError, DgResult};
use crate::storage::asset::LazyAsset;
use crate::storage::settings::{self, GridSettings, KEY_ABOUT};
use crate::storage::{asset_store, catalog, sqlite};
use crate::types::{ColumnType, Row, Schema, Value};
use ahash::AHashSet;
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

pub use mutate::ColumnSource;

/// Where a grid's rows live.
#[derive(Debug, Clone)]
pub(crate) enum Storage {
    InMemory(MemoryRows),
    OnDisk { path: PathBuf },
}

/// Rows of an unsaved grid. Values keep the type they were appended with
/// and are converted to the column's unified type when read or saved.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryRows {
    pub(crate) rows: Vec<Row>,
    /// Columns whose type was declared up front; values convert to it
    pub(crate) declared: AHashSet<String>,
    /// Columns that have only seen NULL so far
    pub(crate) unresolved: AHashSet<String>,
}

pub struct DataGrid {
    name: String,
    schema: Schema,
    settings: GridSettings,
    storage: Storage,
    context: EngineContext,
}

impl std::fmt::Debug for DataGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataGrid")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("on_disk", &self.is_on_disk())
            .finish()
    }
}

impl DataGrid {
    // ════════════════════════════════════════════
    // Constructors
    // ════════════════════════════════════════════

    /// Empty in-memory grid; columns are inferred from the first rows.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: Schema::new(),
            settings: GridSettings::default(),
            storage: Storage::InMemory(MemoryRows::default()),
            context: EngineContext::default(),
        }
    }

    /// In-memory grid with declared column types.
    pub fn with_columns<S: AsRef<str>>(
        name: impl Into<String>,
        columns: &[(S, ColumnType)],
    ) -> DgResult<Self> {
        let mut grid = Self::new(name);
        let mut declared = AHashSet::new();
        for (column, column_type) in columns {
            let column = column.as_ref();
            if let ColumnType::Asset(kind) = column_type {
                grid.context.registry.lookup(kind)?;
            }
            grid.schema.add_column(column, column_type.clone())?;
            declared.insert(column.to_string());
        }
        if let Storage::InMemory(memory) = &mut grid.storage {
            memory.declared = declared;
        }
        Ok(grid)
    }

    /// Loads an on-disk grid.
    pub fn open(path: impl AsRef<Path>) -> DgResult<Self> {
        Self::open_with_context(path, EngineContext::default())
    }

    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open_with_context(path: impl AsRef<Path>, context: EngineContext) -> DgResult<Self> {
        let path = path.as_ref();
        let conn = sqlite::open(path)?;
        let schema = catalog::load_schema(&conn)?;
        let settings = GridSettings::load(&conn)?;
        let name = settings.display_name.clone().unwrap_or_else(|| {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        });
        info!(columns = schema.len(), "grid opened");
        Ok(Self {
            name,
            schema,
            settings,
            storage: Storage::OnDisk {
                path: path.to_path_buf(),
            },
            context,
        })
    }

    pub fn with_context(mut self, context: EngineContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_heuristics(mut self, enabled: bool) -> Self {
        self.settings.heuristics = enabled;
        self
    }

    pub fn with_datetime_format(mut self, format: impl Into<String>) -> Self {
        self.settings.datetime_format = format.into();
        self
    }

    pub fn with_pregenerate_thumbnails(mut self, enabled: bool) -> Self {
        self.settings.pregenerate_thumbnails = enabled;
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.settings.display_name = Some(name.clone());
        self.name = name;
        self
    }

    pub fn with_about(mut self, about: impl Into<String>) -> Self {
        self.settings.about = Some(about.into());
        self
    }

    // ════════════════════════════════════════════
    // Accessors
    // ════════════════════════════════════════════

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn settings(&self) -> &GridSettings {
        &self.settings
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    pub fn is_on_disk(&self) -> bool {
        matches!(self.storage, Storage::OnDisk { .. })
    }

    /// File backing an on-disk grid.
    pub fn path(&self) -> Option<&Path> {
        match &self.storage {
            Storage::OnDisk { path } => Some(path),
            Storage::InMemory(_) => None,
        }
    }

    pub(crate) fn disk_path(&self, operation: &str) -> DgResult<&Path> {
        self.path().ok_or_else(|| DgError::on_disk_only(operation))
    }

    /// Visible column names, `row-id` first.
    pub fn column_names(&self) -> Vec<String> {
        self.schema.names()
    }

    /// Visible columns with their types.
    pub fn columns(&self) -> Vec<(String, ColumnType)> {
        self.schema
            .visible_columns()
            .map(|c| (c.name.clone(), c.column_type.clone()))
            .collect()
    }

    pub fn row_count(&self) -> DgResult<usize> {
        match &self.storage {
            Storage::InMemory(memory) => Ok(memory.rows.len()),
            Storage::OnDisk { path } => {
                let conn = sqlite::open(path)?;
                persist::count_rows(&conn)
            }
        }
    }

    /// Every row, values typed by the current schema.
    pub fn rows(&self) -> DgResult<Vec<Row>> {
        match &self.storage {
            Storage::InMemory(memory) => memory
                .rows
                .iter()
                .map(|row| persist::typed_row(&self.schema, row))
                .collect(),
            Storage::OnDisk { path } => {
                let conn = sqlite::open(path)?;
                persist::read_rows(&conn, &self.schema)
            }
        }
    }

    pub fn about(&self) -> Option<&str> {
        self.settings.about.as_deref()
    }

    pub fn set_about(&mut self, about: impl Into<String>) -> DgResult<()> {
        let about = about.into();
        if let Storage::OnDisk { path } = &self.storage {
            let conn = sqlite::open(path)?;
            settings::set(&conn, KEY_ABOUT, Some(&about))?;
        }
        self.settings.about = Some(about);
        Ok(())
    }

    // ════════════════════════════════════════════
    // Assets
    // ════════════════════════════════════════════

    /// Lazy handle to a stored asset.
    pub fn asset(&self, id: &str) -> DgResult<LazyAsset> {
        let path = self.disk_path("asset")?;
        Ok(LazyAsset::new(path, id, self.context.registry.clone()))
    }

    /// `(asset_type, bytes)` of an asset, inline or stored.
    pub fn asset_data(&self, id: &str) -> DgResult<(String, Vec<u8>)> {
        match &self.storage {
            Storage::OnDisk { path } => {
                let conn = sqlite::open(path)?;
                asset_store::asset_data(&conn, id, &self.context.registry)
            }
            Storage::InMemory(memory) => {
                let asset = memory
                    .rows
                    .iter()
                    .flat_map(|row| row.values())
                    .find_map(|value| match value {
                        Value::Asset(asset) if asset.id() == id => Some(asset),
                        _ => None,
                    })
                    .ok_or_else(|| DgError::AssetNotFound(id.to_string()))?;
                Ok((asset.asset_type().to_string(), asset.data()?))
            }
        }
    }

    /// Deletes stored assets no row references.
    pub fn cleanup_assets(&self) -> DgResult<usize> {
        let path = self.disk_path("cleanup_assets")?;
        let conn = sqlite::open(path)?;
        asset_store::delete_orphaned(&conn, &self.schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::asset::Asset;
    use crate::types::ROW_ID;
    use indexmap::indexmap;

    fn row(pairs: Vec<(&str, Value)>) -> Row {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_new_grid_is_in_memory() {
        let grid = DataGrid::new("g");
        assert!(!grid.is_on_disk());
        assert_eq!(grid.column_names(), vec![ROW_ID]);
        assert_eq!(grid.row_count().unwrap(), 0);
        assert!(grid.cleanup_assets().is_err());
    }

    #[test]
    fn test_with_columns_rejects_unknown_asset_kind() {
        assert!(DataGrid::with_columns("g", &[("h", ColumnType::asset("hologram"))]).is_err());
        let grid = DataGrid::with_columns("g", &[("x", ColumnType::Float)]).unwrap();
        assert_eq!(grid.columns()[1], ("x".to_string(), ColumnType::Float));
    }

    #[test]
    fn test_in_memory_asset_data() {
        let mut grid = DataGrid::new("g");
        let asset = Asset::new("Text", b"hello".to_vec());
        let id = asset.id().to_string();
        grid.append_row(row(vec![("doc", Value::Asset(asset))])).unwrap();

        let (kind, data) = grid.asset_data(&id).unwrap();
        assert_eq!(kind, "Text");
        assert_eq!(data, b"hello");
        assert!(grid.asset_data("missing").unwrap_err().is_not_found());
        assert!(grid.asset(&id).is_err());
    }

    #[test]
    fn test_about_persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("about.datagrid");
        let mut grid = DataGrid::new("g").with_about("draft");
        grid.append_row(indexmap! {"a".to_string() => Value::Integer(1)})
            .unwrap();
        grid.save(&path).unwrap();
        grid.set_about("# Final").unwrap();

        let reopened = DataGrid::open(&path).unwrap();
        assert_eq!(reopened.about(), Some("# Final"));
        assert_eq!(reopened.name(), "about");
    }
}
