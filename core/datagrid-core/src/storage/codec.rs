//! Numeric series codecs.
//!
//! Curves and other long numeric series are stored compactly by scaling to a
//! fixed decimal precision, delta-encoding the resulting integers and
//! run-length encoding the deltas. Evenly spaced x axes collapse to a single
//! run.
//!
//! # Example
//!
//! ```rust
//! use datagrid_core::storage::codec::{compress, decompress};
//!
//! let xs = vec![0.0, 0.1, 0.2, 0.3, 0.4];
//! let packed = compress(&xs, 3).unwrap();
//! assert_eq!(packed.runs.len(), 2);
//! let back = decompress(&packed);
//! assert!((back[4] - 0.4).abs() < 1e-3);
//! ```

use crate::error::{DgError, DgResult};
use serde::{Deserialize, Serialize};

/// Highest supported decimal precision; beyond this `f64` scaling loses
/// integer exactness.
pub const MAX_PRECISION: u32 = 15;

/// Collapses consecutive equal values into `(value, count)` runs.
pub fn rle_encode(values: &[i64]) -> Vec<(i64, u32)> {
    let mut runs: Vec<(i64, u32)> = Vec::new();
    for &value in values {
        match runs.last_mut() {
            Some((last, count)) if *last == value && *count < u32::MAX => *count += 1,
            _ => runs.push((value, 1)),
        }
    }
    runs
}

pub fn rle_decode(runs: &[(i64, u32)]) -> Vec<i64> {
    let len = runs.iter().map(|(_, count)| *count as usize).sum();
    let mut values = Vec::with_capacity(len);
    for &(value, count) in runs {
        values.extend(std::iter::repeat_n(value, count as usize));
    }
    values
}

/// Scaled, delta- and run-length-encoded numeric series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressedSeries {
    pub precision: u32,
    /// Runs of deltas; the first delta is the first scaled value itself.
    pub runs: Vec<(i64, u32)>,
}

impl CompressedSeries {
    pub fn len(&self) -> usize {
        self.runs.iter().map(|(_, count)| *count as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

/// Compresses `series`, keeping `precision` decimal digits.
pub fn compress(series: &[f64], precision: u32) -> DgResult<CompressedSeries> {
    if precision > MAX_PRECISION {
        return Err(DgError::InvalidArguments(format!(
            "precision {} exceeds {}",
            precision, MAX_PRECISION
        )));
    }
    let scale = 10f64.powi(precision as i32);
    let limit = (i64::MAX / 4) as f64;

    let mut deltas = Vec::with_capacity(series.len());
    let mut previous = 0i64;
    for (i, &x) in series.iter().enumerate() {
        let scaled = (x * scale).round();
        if !scaled.is_finite() || scaled.abs() > limit {
            return Err(DgError::InvalidArguments(format!(
                "value {} at index {} cannot be encoded at precision {}",
                x, i, precision
            )));
        }
        let scaled = scaled as i64;
        deltas.push(scaled - previous);
        previous = scaled;
    }

    Ok(CompressedSeries {
        precision,
        runs: rle_encode(&deltas),
    })
}

pub fn decompress(compressed: &CompressedSeries) -> Vec<f64> {
    let scale = 10f64.powi(compressed.precision as i32);
    let mut current = 0i64;
    rle_decode(&compressed.runs)
        .into_iter()
        .map(|delta| {
            current += delta;
            current as f64 / scale
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rle_edges() {
        assert!(rle_encode(&[]).is_empty());
        assert_eq!(rle_encode(&[7]), vec![(7, 1)]);
        assert_eq!(rle_encode(&[1, 1, 2, 1]), vec![(1, 2), (2, 1), (1, 1)]);
        assert_eq!(rle_decode(&[]), Vec::<i64>::new());
    }

    #[test]
    fn test_compress_even_axis() {
        let xs: Vec<f64> = (0..100).map(|i| i as f64 * 0.5).collect();
        let packed = compress(&xs, 2).unwrap();
        // 첫 값 + 일정한 간격
        assert_eq!(packed.runs, vec![(0, 1), (50, 99)]);
        assert_eq!(packed.len(), 100);
        assert_eq!(decompress(&packed), xs);
    }

    #[test]
    fn test_compress_rejects_non_finite() {
        assert!(compress(&[1.0, f64::NAN], 2).is_err());
        assert!(compress(&[f64::INFINITY], 2).is_err());
        assert!(compress(&[1.0], MAX_PRECISION + 1).is_err());
    }

    #[test]
    fn test_compress_empty() {
        let packed = compress(&[], 4).unwrap();
        assert!(packed.is_empty());
        assert!(decompress(&packed).is_empty());
    }

    proptest! {
        #[test]
        fn rle_round_trip(values in proptest::collection::vec(-5i64..5, 0..200)) {
            prop_assert_eq!(rle_decode(&rle_encode(&values)), values);
        }

        #[test]
        fn delta_codec_within_precision(
            series in proptest::collection::vec(-1.0e6f64..1.0e6, 0..100),
            precision in 0u32..7,
        ) {
            let back = decompress(&compress(&series, precision).unwrap());
            prop_assert_eq!(back.len(), series.len());
            let tolerance = 10f64.powi(-(precision as i32));
            for (a, b) in series.iter().zip(back.iter()) {
                prop_assert!((a - b).abs() <= tolerance, "{} vs {}", a, b);
            }
        }
    }
}
