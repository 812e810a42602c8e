//! Storage module — SQLite-backed grid files and the asset store.
//!
//! One grid is one SQLite file holding four tables:
//!
//! | table | contents |
//! |-------|----------|
//! | `datagrid` | typed rows, `column_0` is the row id |
//! | `metadata` | schema catalog plus per-column statistics |
//! | `assets` | content-addressed blobs, metadata and thumbnails |
//! | `settings` | grid-level key/value options |

pub mod asset;
pub mod asset_store;
pub mod cache;
pub mod catalog;
pub mod codec;
pub mod settings;
pub mod sqlite;
pub mod thumbnail;

pub use asset::{Asset, AssetKind, AssetPayload, AssetRegistry, AssetState, LazyAsset, Thumbnail};
pub use asset_store::{AssetLogSession, LogOptions};
pub use cache::BoundedCache;
pub use settings::GridSettings;
pub use thumbnail::{GalleryLayout, PpmThumbnailer, Thumbnailer};
