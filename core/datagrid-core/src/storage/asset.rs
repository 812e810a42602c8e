//! Asset model, per-kind behavior and lazy asset handles
//!
//! An asset is a blob (image, audio, curve, embedding, ...) referenced from
//! grid rows by id. Kind-specific behavior (payload encoding, catalog
//! statistics, whether thumbnails can be rasterized) lives behind the
//! [`AssetKind`] trait; an [`AssetRegistry`] maps kind names to
//! implementations.

use crate::error::{DgError, DgResult};
use crate::storage::codec::{self, CompressedSeries};
use crate::storage::{asset_store, sqlite};
use crate::types::canonical_kind;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

// ════════════════════════════════════════════
// Asset
// ════════════════════════════════════════════

/// Hex digits kept from the SHA-256 content hash.
pub const ASSET_ID_LENGTH: usize = 32;

/// Where an asset's bytes come from.
#[derive(Debug, Clone, PartialEq)]
pub enum AssetPayload {
    Bytes(Vec<u8>),
    /// `file://` URI or plain path, read on demand
    Source(String),
}

/// Thumbnail state. Stored as NULL, an empty BLOB or the bytes.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Thumbnail {
    #[default]
    NotGenerated,
    /// The payload itself is small enough to serve as the thumbnail.
    UseOriginal,
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    id: String,
    asset_type: String,
    payload: AssetPayload,
    metadata: JsonValue,
    thumbnail: Thumbnail,
}

/// Content address of a payload: truncated SHA-256 over kind and content.
pub fn content_id(asset_type: &str, content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_kind(asset_type).as_bytes());
    hasher.update([0u8]);
    hasher.update(content);
    let digest = format!("{:x}", hasher.finalize());
    digest[..ASSET_ID_LENGTH].to_string()
}

impl Asset {
    /// Inline asset addressed by its content.
    pub fn new(asset_type: &str, data: Vec<u8>) -> Self {
        let id = content_id(asset_type, &data);
        Self::build(id, asset_type, AssetPayload::Bytes(data))
    }

    /// Source-backed asset; the payload is fetched when read.
    pub fn from_source(asset_type: &str, uri: &str) -> Self {
        let id = content_id(asset_type, uri.as_bytes());
        let mut asset = Self::build(id, asset_type, AssetPayload::Source(uri.to_string()));
        asset.set_entry("source", json!(uri));
        asset
    }

    /// Reassembles an asset read from the store.
    pub(crate) fn from_parts(
        id: String,
        asset_type: String,
        payload: AssetPayload,
        metadata: JsonValue,
        thumbnail: Thumbnail,
    ) -> Self {
        Self {
            id,
            asset_type,
            payload,
            metadata,
            thumbnail,
        }
    }

    fn build(id: String, asset_type: &str, payload: AssetPayload) -> Self {
        let metadata = json!({ "assetId": id });
        Self {
            id,
            asset_type: canonical_kind(asset_type),
            payload,
            metadata,
            thumbnail: Thumbnail::NotGenerated,
        }
    }

    /// Overrides the content address.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        let id = json!(self.id);
        self.set_entry("assetId", id);
        self
    }

    /// Merges an object into the metadata; `assetId` always wins.
    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        if let JsonValue::Object(entries) = metadata {
            for (key, value) in entries {
                if key != "assetId" {
                    self.set_entry(&key, value);
                }
            }
        }
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: Thumbnail) -> Self {
        self.thumbnail = thumbnail;
        self
    }

    fn set_entry(&mut self, key: &str, value: JsonValue) {
        if !self.metadata.is_object() {
            self.metadata = JsonValue::Object(Map::new());
        }
        if let JsonValue::Object(entries) = &mut self.metadata {
            entries.insert(key.to_string(), value);
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn asset_type(&self) -> &str {
        &self.asset_type
    }

    pub fn payload(&self) -> &AssetPayload {
        &self.payload
    }

    pub fn metadata(&self) -> &JsonValue {
        &self.metadata
    }

    pub fn thumbnail(&self) -> &Thumbnail {
        &self.thumbnail
    }

    /// Payload bytes, reading source-backed assets from their source.
    pub fn data(&self) -> DgResult<Vec<u8>> {
        match &self.payload {
            AssetPayload::Bytes(bytes) => Ok(bytes.clone()),
            AssetPayload::Source(uri) => read_source(uri),
        }
    }
}

/// Reads a `file://` URI or plain path.
pub fn read_source(uri: &str) -> DgResult<Vec<u8>> {
    let path = match uri.strip_prefix("file://") {
        Some(path) => path,
        None if uri.contains("://") => {
            return Err(DgError::AssetNotFound(format!(
                "unsupported asset source '{}'",
                uri
            )));
        }
        None => uri,
    };
    std::fs::read(path).map_err(|_| DgError::AssetNotFound(uri.to_string()))
}

// ════════════════════════════════════════════
// Asset kinds
// ════════════════════════════════════════════

/// Behavior of one asset kind.
pub trait AssetKind: Send + Sync {
    /// Canonical kind name, e.g. `Image`.
    fn name(&self) -> &'static str;

    /// Whether the thumbnailer can rasterize this kind.
    fn is_raster(&self) -> bool {
        false
    }

    /// Encodes payload bytes for the `asset_data` column.
    fn serialize(&self, data: &[u8], _metadata: &JsonValue) -> DgResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    /// Inverse of [`AssetKind::serialize`].
    fn deserialize(&self, stored: &[u8], _metadata: &JsonValue) -> DgResult<Vec<u8>> {
        Ok(stored.to_vec())
    }

    /// Kind-specific catalog extras computed over a column's metadata
    /// snapshots.
    fn compute_statistics(&self, _metadata: &[JsonValue]) -> JsonValue {
        JsonValue::Null
    }
}

/// Annotated images. Metadata carries
/// `annotations: [{name, data: [{label, score?, boxes?}]}]`.
pub struct ImageKind;

impl AssetKind for ImageKind {
    fn name(&self) -> &'static str {
        "Image"
    }

    fn is_raster(&self) -> bool {
        true
    }

    fn compute_statistics(&self, metadata: &[JsonValue]) -> JsonValue {
        annotation_summary(metadata.iter())
    }
}

/// Label counts and score ranges across annotation metadata.
pub fn annotation_summary<'a>(metadata: impl Iterator<Item = &'a JsonValue>) -> JsonValue {
    let mut labels: BTreeMap<String, u64> = BTreeMap::new();
    let mut scores: BTreeMap<String, (f64, f64)> = BTreeMap::new();
    for entry in metadata {
        let Some(layers) = entry.get("annotations").and_then(JsonValue::as_array) else {
            continue;
        };
        for item in layers
            .iter()
            .filter_map(|layer| layer.get("data").and_then(JsonValue::as_array))
            .flatten()
        {
            let Some(label) = item.get("label").and_then(JsonValue::as_str) else {
                continue;
            };
            *labels.entry(label.to_string()).or_default() += 1;
            if let Some(score) = item.get("score").and_then(JsonValue::as_f64) {
                let range = scores.entry(label.to_string()).or_insert((score, score));
                range.0 = range.0.min(score);
                range.1 = range.1.max(score);
            }
        }
    }
    let scores: Map<String, JsonValue> = scores
        .into_iter()
        .map(|(label, (lo, hi))| (label, json!([lo, hi])))
        .collect();
    json!({ "labels": labels, "scores": scores })
}

pub struct AudioKind;

impl AssetKind for AudioKind {
    fn name(&self) -> &'static str {
        "Audio"
    }
}

pub struct VideoKind;

impl AssetKind for VideoKind {
    fn name(&self) -> &'static str {
        "Video"
    }
}

pub struct TextKind;

impl AssetKind for TextKind {
    fn name(&self) -> &'static str {
        "Text"
    }
}

/// Named x/y series. Payload is `{"x": [..], "y": [..]}`; stored compressed.
pub struct CurveKind;

/// Decimal digits kept when no `precision` is given in the metadata.
pub const DEFAULT_CURVE_PRECISION: u32 = 4;

#[derive(Serialize, Deserialize)]
struct CurvePoints {
    x: Vec<f64>,
    y: Vec<f64>,
}

#[derive(Serialize, Deserialize)]
struct StoredCurve {
    x: CompressedSeries,
    y: CompressedSeries,
}

impl CurveKind {
    /// Builds a curve asset.
    pub fn asset(name: &str, x: Vec<f64>, y: Vec<f64>) -> DgResult<Asset> {
        if x.len() != y.len() {
            return Err(DgError::InvalidArguments(format!(
                "curve '{}' has {} x values and {} y values",
                name,
                x.len(),
                y.len()
            )));
        }
        let data = serde_json::to_vec(&CurvePoints { x, y })?;
        Ok(Asset::new("Curve", data).with_metadata(json!({ "name": name })))
    }
}

impl AssetKind for CurveKind {
    fn name(&self) -> &'static str {
        "Curve"
    }

    fn serialize(&self, data: &[u8], metadata: &JsonValue) -> DgResult<Vec<u8>> {
        let points: CurvePoints = serde_json::from_slice(data)?;
        let precision = metadata
            .get("precision")
            .and_then(JsonValue::as_u64)
            .map_or(DEFAULT_CURVE_PRECISION, |p| p as u32);
        let stored = StoredCurve {
            x: codec::compress(&points.x, precision)?,
            y: codec::compress(&points.y, precision)?,
        };
        Ok(serde_json::to_vec(&stored)?)
    }

    fn deserialize(&self, stored: &[u8], _metadata: &JsonValue) -> DgResult<Vec<u8>> {
        let stored: StoredCurve = serde_json::from_slice(stored)?;
        let points = CurvePoints {
            x: codec::decompress(&stored.x),
            y: codec::decompress(&stored.y),
        };
        Ok(serde_json::to_vec(&points)?)
    }

    fn compute_statistics(&self, metadata: &[JsonValue]) -> JsonValue {
        let names: BTreeSet<&str> = metadata
            .iter()
            .filter_map(|m| m.get("name").and_then(JsonValue::as_str))
            .collect();
        json!({ "names": names })
    }
}

/// Numeric vectors; projection coordinates are attached to the metadata.
pub struct EmbeddingKind;

impl EmbeddingKind {
    pub fn asset(vector: &[f64]) -> DgResult<Asset> {
        Ok(Asset::new("Embedding", serde_json::to_vec(vector)?))
    }

    /// Decodes a payload into its vector.
    pub fn vector(data: &[u8]) -> DgResult<Vec<f64>> {
        Ok(serde_json::from_slice(data)?)
    }
}

impl AssetKind for EmbeddingKind {
    fn name(&self) -> &'static str {
        "Embedding"
    }

    fn serialize(&self, data: &[u8], _metadata: &JsonValue) -> DgResult<Vec<u8>> {
        // 벡터가 아니면 저장하지 않는다
        Self::vector(data)?;
        Ok(data.to_vec())
    }

    fn compute_statistics(&self, metadata: &[JsonValue]) -> JsonValue {
        let mut ranges: Vec<(f64, f64)> = Vec::new();
        for point in metadata
            .iter()
            .filter_map(|m| m.get("projection").and_then(JsonValue::as_array))
        {
            for (axis, value) in point.iter().filter_map(JsonValue::as_f64).enumerate() {
                match ranges.get_mut(axis) {
                    Some(range) => {
                        range.0 = range.0.min(value);
                        range.1 = range.1.max(value);
                    }
                    None => ranges.push((value, value)),
                }
            }
        }
        if ranges.is_empty() {
            return JsonValue::Null;
        }
        json!({
            "projection_ranges": ranges.iter().map(|(lo, hi)| json!([lo, hi])).collect::<Vec<_>>(),
        })
    }
}

pub struct TensorKind;

impl AssetKind for TensorKind {
    fn name(&self) -> &'static str {
        "Tensor"
    }

    fn compute_statistics(&self, metadata: &[JsonValue]) -> JsonValue {
        let shapes: BTreeSet<String> = metadata
            .iter()
            .filter_map(|m| m.get("shape"))
            .map(JsonValue::to_string)
            .collect();
        json!({ "shapes": shapes })
    }
}

// ════════════════════════════════════════════
// Registry
// ════════════════════════════════════════════

/// Kind name → implementation.
pub struct AssetRegistry {
    kinds: RwLock<HashMap<String, Arc<dyn AssetKind>>>,
}

impl Default for AssetRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl AssetRegistry {
    /// Registry with no kinds.
    pub fn new() -> Self {
        Self {
            kinds: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the built-in kinds.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(ImageKind));
        registry.register(Arc::new(AudioKind));
        registry.register(Arc::new(VideoKind));
        registry.register(Arc::new(TextKind));
        registry.register(Arc::new(CurveKind));
        registry.register(Arc::new(EmbeddingKind));
        registry.register(Arc::new(TensorKind));
        registry
    }

    /// Adds or replaces a kind.
    pub fn register(&self, kind: Arc<dyn AssetKind>) {
        self.kinds.write().insert(kind.name().to_uppercase(), kind);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AssetKind>> {
        self.kinds.read().get(&name.to_uppercase()).cloned()
    }

    pub fn lookup(&self, name: &str) -> DgResult<Arc<dyn AssetKind>> {
        self.get(name)
            .ok_or_else(|| DgError::Schema(format!("unknown asset type '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kinds.read().contains_key(&name.to_uppercase())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .kinds
            .read()
            .values()
            .map(|k| k.name().to_string())
            .collect();
        names.sort();
        names
    }
}

// ════════════════════════════════════════════
// Lazy handles
// ════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
pub enum AssetState {
    Unloaded,
    Loaded(Box<Asset>),
}

/// Handle to a stored asset that reads the store on first access.
pub struct LazyAsset {
    path: PathBuf,
    id: String,
    registry: Arc<AssetRegistry>,
    state: AssetState,
}

impl LazyAsset {
    pub fn new(
        path: impl AsRef<Path>,
        id: impl Into<String>,
        registry: Arc<AssetRegistry>,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            id: id.into(),
            registry,
            state: AssetState::Unloaded,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &AssetState {
        &self.state
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, AssetState::Loaded(_))
    }

    fn load(&mut self) -> DgResult<&Asset> {
        if let AssetState::Unloaded = self.state {
            let conn = sqlite::open(&self.path)?;
            let asset = asset_store::fetch_asset(&conn, &self.id, &self.registry)?;
            self.state = AssetState::Loaded(Box::new(asset));
        }
        match &self.state {
            AssetState::Loaded(asset) => Ok(asset),
            AssetState::Unloaded => Err(DgError::AssetNotFound(self.id.clone())),
        }
    }

    pub fn asset_type(&mut self) -> DgResult<&str> {
        Ok(self.load()?.asset_type())
    }

    pub fn metadata(&mut self) -> DgResult<&JsonValue> {
        Ok(self.load()?.metadata())
    }

    /// Decoded payload bytes.
    pub fn data(&mut self) -> DgResult<Vec<u8>> {
        self.load()?.data()
    }

    pub fn into_asset(mut self) -> DgResult<Asset> {
        self.load()?;
        match self.state {
            AssetState::Loaded(asset) => Ok(*asset),
            AssetState::Unloaded => Err(DgError::AssetNotFound(self.id)),
        }
    }
}
