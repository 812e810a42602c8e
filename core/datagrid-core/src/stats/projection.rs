//! Embedding projection hook
//!
//! Embeddings are sampled down to a bounded number of dimensions and handed
//! to a [`Projector`]; the resulting 2-D points are written into each asset's
//! metadata under `projection`. Both the sampled indices and the fitted
//! points are memoized in the engine's bounded cache.

use crate::error::{DgError, DgResult};
use crate::storage::asset::{AssetRegistry, EmbeddingKind, content_id};
use crate::storage::asset_store;
use crate::storage::cache::BoundedCache;
use crate::types::Column;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rusqlite::Connection;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, instrument};

/// Seed of the dimension sampler, so repeated saves pick the same axes.
pub const SAMPLE_SEED: u64 = 42;

/// Maps embedding vectors to 2-D points.
pub trait Projector: Send + Sync {
    fn name(&self) -> &'static str;

    /// One point per input vector, in order.
    fn project(&self, vectors: &[Vec<f64>]) -> DgResult<Vec<[f64; 2]>>;
}

/// Mean-centered projection onto the first two axes.
#[derive(Debug, Default, Clone, Copy)]
pub struct AxisProjector;

impl Projector for AxisProjector {
    fn name(&self) -> &'static str {
        "axis"
    }

    fn project(&self, vectors: &[Vec<f64>]) -> DgResult<Vec<[f64; 2]>> {
        if vectors.is_empty() {
            return Ok(Vec::new());
        }
        let mean = |axis: usize| {
            vectors
                .iter()
                .map(|v| v.get(axis).copied().unwrap_or(0.0))
                .sum::<f64>()
                / vectors.len() as f64
        };
        let (mx, my) = (mean(0), mean(1));
        Ok(vectors
            .iter()
            .map(|v| {
                [
                    v.first().copied().unwrap_or(0.0) - mx,
                    v.get(1).copied().unwrap_or(0.0) - my,
                ]
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Sampled dimension indices
    Sample {
        dimensions: usize,
        target: usize,
        seed: u64,
    },
    /// Fitted points for a set of assets
    Projection {
        projector: &'static str,
        digest: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CachedItem {
    Indices(Vec<usize>),
    Points(Vec<[f64; 2]>),
}

pub type ProjectionCache = BoundedCache<CacheKey, CachedItem>;

/// Sorted indices of `target` dimensions out of `dimensions`, or all of them
/// when there are few enough.
pub fn sample_dimensions(
    cache: &ProjectionCache,
    dimensions: usize,
    target: usize,
    seed: u64,
) -> Vec<usize> {
    if dimensions <= target {
        return (0..dimensions).collect();
    }
    let key = CacheKey::Sample {
        dimensions,
        target,
        seed,
    };
    match cache.get_or_insert_with(key, || {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut indices = sample(&mut rng, dimensions, target).into_vec();
        indices.sort_unstable();
        CachedItem::Indices(indices)
    }) {
        CachedItem::Indices(indices) => indices,
        CachedItem::Points(_) => (0..target).collect(),
    }
}

/// Projects every embedding referenced by `column` and stores the points in
/// the asset metadata. Returns how many assets were updated.
#[instrument(skip_all, fields(column = %column.name))]
pub fn project_column(
    conn: &Connection,
    column: &Column,
    registry: &AssetRegistry,
    cache: &ProjectionCache,
    projector: &dyn Projector,
    max_dimensions: usize,
) -> DgResult<usize> {
    let sql = format!(
        "SELECT DISTINCT {0} FROM datagrid WHERE {0} IS NOT NULL ORDER BY {0}",
        column.field_name
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    if ids.is_empty() {
        return Ok(0);
    }

    let mut vectors = Vec::with_capacity(ids.len());
    for id in &ids {
        let (_, data) = asset_store::asset_data(conn, id, registry)?;
        vectors.push(EmbeddingKind::vector(&data)?);
    }
    let dimensions = vectors.iter().map(Vec::len).max().unwrap_or(0);
    let axes = sample_dimensions(cache, dimensions, max_dimensions, SAMPLE_SEED);
    let sampled: Vec<Vec<f64>> = vectors
        .iter()
        .map(|v| axes.iter().map(|&i| v.get(i).copied().unwrap_or(0.0)).collect())
        .collect();

    let key = CacheKey::Projection {
        projector: projector.name(),
        digest: content_id("projection", ids.join(",").as_bytes()),
    };
    let points = match cache.get(&key) {
        Some(CachedItem::Points(points)) => points,
        _ => {
            let points = projector.project(&sampled)?;
            if points.len() != ids.len() {
                return Err(DgError::InvalidArguments(format!(
                    "projector '{}' returned {} points for {} vectors",
                    projector.name(),
                    points.len(),
                    ids.len()
                )));
            }
            cache.insert(key, CachedItem::Points(points.clone()));
            points
        }
    };

    for (id, point) in ids.iter().zip(&points) {
        let mut metadata = asset_store::asset_metadata(conn, id)?;
        if !metadata.is_object() {
            metadata = json!({});
        }
        metadata["projection"] = json!([point[0], point[1]]);
        asset_store::update_metadata(conn, id, &metadata)?;
    }
    debug!(assets = ids.len(), dimensions, "embeddings projected");
    Ok(ids.len())
}

/// Stored projection of an asset, if any.
pub fn projection_of(metadata: &JsonValue) -> Option<[f64; 2]> {
    let point = metadata.get("projection")?.as_array()?;
    Some([point.first()?.as_f64()?, point.get(1)?.as_f64()?])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_is_cached_and_stable() {
        let cache = ProjectionCache::new(4);
        let first = sample_dimensions(&cache, 100, 10, SAMPLE_SEED);
        assert_eq!(first.len(), 10);
        assert!(first.windows(2).all(|w| w[0] < w[1]));
        assert!(first.iter().all(|&i| i < 100));
        let second = sample_dimensions(&cache, 100, 10, SAMPLE_SEED);
        assert_eq!(first, second);
        assert_eq!(cache.stats().hits, 1);

        assert_eq!(sample_dimensions(&cache, 3, 10, SAMPLE_SEED), vec![0, 1, 2]);
    }

    #[test]
    fn test_axis_projector_centers() {
        let points = AxisProjector
            .project(&[vec![1.0, 2.0, 9.0], vec![3.0, 4.0, 9.0]])
            .unwrap();
        assert_eq!(points, vec![[-1.0, -1.0], [1.0, 1.0]]);
        assert!(AxisProjector.project(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_projection_of() {
        assert_eq!(projection_of(&json!({"projection": [1.0, 2.5]})), Some([1.0, 2.5]));
        assert_eq!(projection_of(&json!({})), None);
    }
}
