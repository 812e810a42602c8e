//! Engine configuration and the context passed to every entry point
//!
//! # Environment Variables
//! - `DATAGRID_ROOT` - directory DGIDs resolve against (default: ".")
//! - `DATAGRID_CACHE_CAPACITY` - projection cache entries (default: 100)
//! - `DATAGRID_MAX_CATEGORIES` - distinct values still reported as a
//!   category breakdown (default: 20)

use crate::stats::projection::{AxisProjector, ProjectionCache, Projector};
use crate::storage::asset::AssetRegistry;
use crate::storage::cache::DEFAULT_CACHE_CAPACITY;
use crate::storage::thumbnail::{GalleryLayout, PpmThumbnailer, Thumbnailer};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const ENV_ROOT: &str = "DATAGRID_ROOT";
pub const ENV_CACHE_CAPACITY: &str = "DATAGRID_CACHE_CAPACITY";
pub const ENV_MAX_CATEGORIES: &str = "DATAGRID_MAX_CATEGORIES";

/// Engine-wide tunables
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub root: PathBuf,
    pub cache_capacity: usize,
    /// Category breakdowns are reported up to this many distinct values
    pub max_category_unique: usize,
    pub histogram_bins: usize,
    pub default_page_size: usize,
    /// Bounding box of generated thumbnails
    pub thumbnail_size: (usize, usize),
    /// Embeddings wider than this are sampled down before projection
    pub max_projection_dimensions: usize,
    pub gallery: GalleryLayout,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_category_unique: 20,
            histogram_bins: 10,
            default_page_size: 10,
            thumbnail_size: (100, 100),
            max_projection_dimensions: 50,
            gallery: GalleryLayout::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overridden by `lookup`; unparsable values are ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(root) = lookup(ENV_ROOT).filter(|v| !v.is_empty()) {
            config.root = PathBuf::from(root);
        }
        if let Some(capacity) = lookup(ENV_CACHE_CAPACITY).and_then(|v| v.parse().ok()) {
            config.cache_capacity = capacity;
        }
        if let Some(max) = lookup(ENV_MAX_CATEGORIES).and_then(|v| v.parse().ok()) {
            config.max_category_unique = max;
        }
        config
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_max_category_unique(mut self, max: usize) -> Self {
        self.max_category_unique = max;
        self
    }

    pub fn with_histogram_bins(mut self, bins: usize) -> Self {
        self.histogram_bins = bins.max(1);
        self
    }

    pub fn with_default_page_size(mut self, size: usize) -> Self {
        self.default_page_size = size.max(1);
        self
    }

    pub fn with_thumbnail_size(mut self, width: usize, height: usize) -> Self {
        self.thumbnail_size = (width, height);
        self
    }

    pub fn with_max_projection_dimensions(mut self, dims: usize) -> Self {
        self.max_projection_dimensions = dims.max(2);
        self
    }

    pub fn with_gallery(mut self, gallery: GalleryLayout) -> Self {
        self.gallery = gallery;
        self
    }
}

/// Shared state handed to engine entry points instead of process globals.
#[derive(Clone)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub cache: Arc<ProjectionCache>,
    pub registry: Arc<AssetRegistry>,
    pub thumbnailer: Arc<dyn Thumbnailer>,
    pub projector: Arc<dyn Projector>,
}

impl EngineContext {
    pub fn new(config: EngineConfig) -> Self {
        let (width, height) = config.thumbnail_size;
        Self {
            cache: Arc::new(ProjectionCache::new(config.cache_capacity)),
            registry: Arc::new(AssetRegistry::with_defaults()),
            thumbnailer: Arc::new(PpmThumbnailer::new(width, height)),
            projector: Arc::new(AxisProjector),
            config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(EngineConfig::from_env())
    }

    pub fn with_registry(mut self, registry: Arc<AssetRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_thumbnailer(mut self, thumbnailer: Arc<dyn Thumbnailer>) -> Self {
        self.thumbnailer = thumbnailer;
        self
    }

    pub fn with_projector(mut self, projector: Arc<dyn Projector>) -> Self {
        self.projector = projector;
        self
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_category_unique, 20);
        assert_eq!(config.histogram_bins, 10);
        assert_eq!(config.root, PathBuf::from("."));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_ROOT, "/data/grids"),
            (ENV_CACHE_CAPACITY, "7"),
            (ENV_MAX_CATEGORIES, "not-a-number"),
        ]);
        let config = EngineConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.root, PathBuf::from("/data/grids"));
        assert_eq!(config.cache_capacity, 7);
        assert_eq!(config.max_category_unique, 20);
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new("/tmp")
            .with_histogram_bins(0)
            .with_max_category_unique(5);
        assert_eq!(config.histogram_bins, 1);
        assert_eq!(config.max_category_unique, 5);

        let context = EngineContext::new(config.with_cache_capacity(3));
        assert_eq!(context.cache.capacity(), 3);
        assert_eq!(context.root(), Path::new("/tmp"));
    }
}
