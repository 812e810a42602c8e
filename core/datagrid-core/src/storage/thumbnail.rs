//! Thumbnail generation and gallery composition
//!
//! Rendering real image formats is left to the host; the engine only talks to
//! the [`Thumbnailer`] trait. [`PpmThumbnailer`] is the built-in
//! implementation and understands binary PPM (`P6`) rasters, which is enough
//! to drive the thumbnail and gallery code paths end to end.

use crate::error::{DgError, DgResult};
use serde_json::Value as JsonValue;

/// Renders thumbnails and composes asset galleries.
pub trait Thumbnailer: Send + Sync {
    /// Thumbnail bytes for an asset payload, `None` when the original should
    /// be served as is.
    fn thumbnail(
        &self,
        asset_type: &str,
        data: &[u8],
        metadata: &JsonValue,
    ) -> DgResult<Option<Vec<u8>>>;

    /// Stitches tiles (thumbnail bytes) into one image laid out on `layout`.
    fn compose(&self, layout: &GalleryLayout, tiles: &[Vec<u8>]) -> DgResult<Vec<u8>>;
}

// ════════════════════════════════════════════
// Gallery geometry
// ════════════════════════════════════════════

/// Fixed-grid gallery canvas
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryLayout {
    pub rows: usize,
    pub cols: usize,
    pub cell_width: usize,
    pub cell_height: usize,
    pub border_width: usize,
    pub background: [u8; 3],
    pub border_color: [u8; 3],
}

impl Default for GalleryLayout {
    fn default() -> Self {
        Self {
            rows: 2,
            cols: 3,
            cell_width: 100,
            cell_height: 100,
            border_width: 1,
            background: [255, 255, 255],
            border_color: [128, 128, 128],
        }
    }
}

impl GalleryLayout {
    pub fn with_grid(mut self, rows: usize, cols: usize) -> Self {
        self.rows = rows.max(1);
        self.cols = cols.max(1);
        self
    }

    pub fn with_cell_size(mut self, width: usize, height: usize) -> Self {
        self.cell_width = width.max(1);
        self.cell_height = height.max(1);
        self
    }

    pub fn with_border(mut self, width: usize, color: [u8; 3]) -> Self {
        self.border_width = width;
        self.border_color = color;
        self
    }

    pub fn with_background(mut self, color: [u8; 3]) -> Self {
        self.background = color;
        self
    }

    pub fn capacity(&self) -> usize {
        self.rows * self.cols
    }

    pub fn canvas_size(&self) -> (usize, usize) {
        (
            self.cols * self.cell_width + (self.cols + 1) * self.border_width,
            self.rows * self.cell_height + (self.rows + 1) * self.border_width,
        )
    }

    /// Top-left pixel of cell `index`, row-major.
    pub fn cell_origin(&self, index: usize) -> (usize, usize) {
        let (row, col) = (index / self.cols, index % self.cols);
        (
            self.border_width + col * (self.cell_width + self.border_width),
            self.border_width + row * (self.cell_height + self.border_width),
        )
    }
}

// ════════════════════════════════════════════
// PPM raster
// ════════════════════════════════════════════

/// 8-bit RGB raster
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl Raster {
    pub fn filled(width: usize, height: usize, color: [u8; 3]) -> Self {
        let mut pixels = Vec::with_capacity(width * height * 3);
        for _ in 0..width * height {
            pixels.extend_from_slice(&color);
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Parses a binary `P6` PPM with maxval 255.
    pub fn decode_ppm(bytes: &[u8]) -> Option<Self> {
        let mut pos = 0;
        let mut fields = Vec::with_capacity(4);
        while fields.len() < 4 {
            while pos < bytes.len() {
                if bytes[pos] == b'#' {
                    while pos < bytes.len() && bytes[pos] != b'\n' {
                        pos += 1;
                    }
                } else if bytes[pos].is_ascii_whitespace() {
                    pos += 1;
                } else {
                    break;
                }
            }
            let start = pos;
            while pos < bytes.len() && !bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            if start == pos {
                return None;
            }
            fields.push(std::str::from_utf8(&bytes[start..pos]).ok()?);
        }
        if fields[0] != "P6" || fields[3] != "255" {
            return None;
        }
        let width: usize = fields[1].parse().ok()?;
        let height: usize = fields[2].parse().ok()?;
        // exactly one whitespace byte separates header and pixels
        let data = bytes.get(pos + 1..)?;
        let len = width.checked_mul(height)?.checked_mul(3)?;
        if data.len() < len || width == 0 || height == 0 {
            return None;
        }
        Some(Self {
            width,
            height,
            pixels: data[..len].to_vec(),
        })
    }

    pub fn encode_ppm(&self) -> Vec<u8> {
        let mut out = format!("P6\n{} {}\n255\n", self.width, self.height).into_bytes();
        out.extend_from_slice(&self.pixels);
        out
    }

    fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width + x) * 3;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2]]
    }

    fn set_pixel(&mut self, x: usize, y: usize, color: [u8; 3]) {
        if x < self.width && y < self.height {
            let i = (y * self.width + x) * 3;
            self.pixels[i..i + 3].copy_from_slice(&color);
        }
    }

    /// Nearest-neighbour resize.
    pub fn resize(&self, width: usize, height: usize) -> Self {
        let mut out = Raster::filled(width.max(1), height.max(1), [0, 0, 0]);
        for y in 0..out.height {
            let sy = y * self.height / out.height;
            for x in 0..out.width {
                let sx = x * self.width / out.width;
                out.set_pixel(x, y, self.pixel(sx, sy));
            }
        }
        out
    }

    /// Largest size fitting in `max_w` × `max_h` with the same aspect ratio.
    pub fn fit_within(&self, max_w: usize, max_h: usize) -> (usize, usize) {
        let scale = f64::min(
            max_w as f64 / self.width as f64,
            max_h as f64 / self.height as f64,
        )
        .min(1.0);
        (
            ((self.width as f64 * scale).round() as usize).max(1),
            ((self.height as f64 * scale).round() as usize).max(1),
        )
    }

    pub fn blit(&mut self, src: &Raster, ox: usize, oy: usize) {
        for y in 0..src.height {
            for x in 0..src.width {
                self.set_pixel(ox + x, oy + y, src.pixel(x, y));
            }
        }
    }

    pub fn draw_rect(&mut self, x0: usize, y0: usize, x1: usize, y1: usize, color: [u8; 3]) {
        let x1 = x1.min(self.width.saturating_sub(1));
        let y1 = y1.min(self.height.saturating_sub(1));
        for x in x0..=x1 {
            self.set_pixel(x, y0, color);
            self.set_pixel(x, y1, color);
        }
        for y in y0..=y1 {
            self.set_pixel(x0, y, color);
            self.set_pixel(x1, y, color);
        }
    }
}

// ════════════════════════════════════════════
// Default thumbnailer
// ════════════════════════════════════════════

const ANNOTATION_COLOR: [u8; 3] = [255, 0, 0];

/// PPM thumbnailer with annotation box overlay.
#[derive(Debug, Clone)]
pub struct PpmThumbnailer {
    pub max_width: usize,
    pub max_height: usize,
}

impl Default for PpmThumbnailer {
    fn default() -> Self {
        Self {
            max_width: 100,
            max_height: 100,
        }
    }
}

impl PpmThumbnailer {
    pub fn new(max_width: usize, max_height: usize) -> Self {
        Self {
            max_width: max_width.max(1),
            max_height: max_height.max(1),
        }
    }
}

/// Boxes as `[x, y, width, height]` in source pixel coordinates.
fn annotation_boxes(metadata: &JsonValue) -> Vec<[f64; 4]> {
    let Some(layers) = metadata.get("annotations").and_then(JsonValue::as_array) else {
        return Vec::new();
    };
    layers
        .iter()
        .filter_map(|layer| layer.get("data").and_then(JsonValue::as_array))
        .flatten()
        .filter_map(|item| item.get("boxes").and_then(JsonValue::as_array))
        .flatten()
        .filter_map(|b| {
            let v: Vec<f64> = b.as_array()?.iter().filter_map(JsonValue::as_f64).collect();
            (v.len() == 4).then(|| [v[0], v[1], v[2], v[3]])
        })
        .collect()
}

impl Thumbnailer for PpmThumbnailer {
    fn thumbnail(
        &self,
        _asset_type: &str,
        data: &[u8],
        metadata: &JsonValue,
    ) -> DgResult<Option<Vec<u8>>> {
        let Some(raster) = Raster::decode_ppm(data) else {
            return Ok(None);
        };
        let boxes = annotation_boxes(metadata);
        if boxes.is_empty() && raster.width <= self.max_width && raster.height <= self.max_height {
            return Ok(None);
        }

        let (w, h) = raster.fit_within(self.max_width, self.max_height);
        let mut thumb = raster.resize(w, h);
        let (sx, sy) = (w as f64 / raster.width as f64, h as f64 / raster.height as f64);
        for [x, y, bw, bh] in boxes {
            let x0 = (x * sx).max(0.0) as usize;
            let y0 = (y * sy).max(0.0) as usize;
            let x1 = ((x + bw) * sx).max(0.0) as usize;
            let y1 = ((y + bh) * sy).max(0.0) as usize;
            thumb.draw_rect(x0, y0, x1, y1, ANNOTATION_COLOR);
        }
        Ok(Some(thumb.encode_ppm()))
    }

    fn compose(&self, layout: &GalleryLayout, tiles: &[Vec<u8>]) -> DgResult<Vec<u8>> {
        if tiles.len() > layout.capacity() {
            return Err(DgError::InvalidArguments(format!(
                "{} tiles do not fit a {}x{} gallery",
                tiles.len(),
                layout.rows,
                layout.cols
            )));
        }
        let (width, height) = layout.canvas_size();
        let mut canvas = Raster::filled(width, height, layout.border_color);
        let cell = Raster::filled(layout.cell_width, layout.cell_height, layout.background);

        for index in 0..layout.capacity() {
            let (ox, oy) = layout.cell_origin(index);
            canvas.blit(&cell, ox, oy);
            let Some(tile) = tiles.get(index).and_then(|t| Raster::decode_ppm(t)) else {
                continue;
            };
            let (w, h) = tile.fit_within(layout.cell_width, layout.cell_height);
            let scaled = tile.resize(w, h);
            canvas.blit(
                &scaled,
                ox + (layout.cell_width - w) / 2,
                oy + (layout.cell_height - h) / 2,
            );
        }
        Ok(canvas.encode_ppm())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ppm(width: usize, height: usize, color: [u8; 3]) -> Vec<u8> {
        Raster::filled(width, height, color).encode_ppm()
    }

    #[test]
    fn test_ppm_round_trip() {
        let bytes = ppm(3, 2, [1, 2, 3]);
        let raster = Raster::decode_ppm(&bytes).unwrap();
        assert_eq!((raster.width, raster.height), (3, 2));
        assert_eq!(raster.encode_ppm(), bytes);
        assert!(Raster::decode_ppm(b"P3\n1 1\n255\n000").is_none());
        assert!(Raster::decode_ppm(b"not an image").is_none());
    }

    #[test]
    fn test_small_image_uses_original() {
        let thumbnailer = PpmThumbnailer::new(10, 10);
        let result = thumbnailer
            .thumbnail("Image", &ppm(4, 4, [0, 0, 0]), &json!({}))
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_large_image_is_shrunk() {
        let thumbnailer = PpmThumbnailer::new(10, 10);
        let thumb = thumbnailer
            .thumbnail("Image", &ppm(40, 20, [9, 9, 9]), &json!({}))
            .unwrap()
            .unwrap();
        let raster = Raster::decode_ppm(&thumb).unwrap();
        assert_eq!((raster.width, raster.height), (10, 5));
    }

    #[test]
    fn test_annotation_overlay() {
        let thumbnailer = PpmThumbnailer::new(10, 10);
        let metadata = json!({"annotations": [{"name": "gt", "data": [
            {"label": "dog", "boxes": [[0, 0, 4, 4]]}
        ]}]});
        let thumb = thumbnailer
            .thumbnail("Image", &ppm(8, 8, [0, 0, 0]), &metadata)
            .unwrap()
            .unwrap();
        let raster = Raster::decode_ppm(&thumb).unwrap();
        assert_eq!(raster.pixel(0, 0), ANNOTATION_COLOR);
        assert_eq!(raster.pixel(7, 7), [0, 0, 0]);
    }

    #[test]
    fn test_gallery_compose() {
        let layout = GalleryLayout::default()
            .with_grid(1, 2)
            .with_cell_size(4, 4)
            .with_border(1, [7, 7, 7])
            .with_background([255, 255, 255]);
        assert_eq!(layout.canvas_size(), (11, 6));

        let thumbnailer = PpmThumbnailer::default();
        let image = thumbnailer
            .compose(&layout, &[ppm(4, 4, [1, 1, 1])])
            .unwrap();
        let canvas = Raster::decode_ppm(&image).unwrap();
        assert_eq!(canvas.pixel(0, 0), [7, 7, 7]);
        assert_eq!(canvas.pixel(1, 1), [1, 1, 1]);
        // 두 번째 칸은 배경색
        assert_eq!(canvas.pixel(6, 1), [255, 255, 255]);

        let too_many = vec![ppm(1, 1, [0, 0, 0]); 3];
        assert!(thumbnailer.compose(&layout, &too_many).is_err());
    }
}
