// THEORY:
// The `TileGrid` is the coarse spatial layer of artifact construction. A whole
// slide is far too large to sample uniformly, so the binary mask is first cut
// into a grid of large tiles, and only tiles that contain enough tissue are
// kept. Each kept tile then reports its tissue density and centre of mass, which
// is all the `sampler` needs to place patches.
//
// Key architectural principles:
// 1.  **Summed-area table**: `ForegroundMask` keeps an integral image of the
//     binarized mask, so the foreground count of any rectangle (a tile, or one
//     of the thousands of candidate patches) is four lookups.
// 2.  **Edge absorption**: slides are rarely a multiple of the tile size. Along
//     each axis a short trailing strip (below `edge_overlap` percent of a tile)
//     is merged into the last full tile; a long strip becomes its own edge tile.
//     No tissue at the border is ever dropped.
// 3.  **Row-major determinism**: kept tiles are produced in row-major order, which
//     fixes the order in which sequences are drawn and therefore the artifact
//     bytes.

use crate::config::{MaskConfig, MaskPolarity, PatchConfig};
use image::GrayImage;

/// A binarized mask with a summed-area table for O(1) rectangle counts.
#[derive(Debug, Clone)]
pub struct ForegroundMask {
    width: u32,
    height: u32,
    /// `(width + 1) × (height + 1)` prefix sums, row-major, kept modulo 2^32.
    /// Rectangle differences are exact while an image has at most `u32::MAX`
    /// pixels, which the loader enforces.
    integral: Vec<u32>,
}

impl ForegroundMask {
    /// Binarizes a single-channel mask according to the configured polarity.
    pub fn from_gray(gray: &GrayImage, config: &MaskConfig) -> Self {
        let (width, height) = gray.dimensions();
        let stride = width as usize + 1;
        let mut integral = vec![0u32; stride * (height as usize + 1)];

        for y in 0..height as usize {
            let mut row_sum = 0u32;
            for x in 0..width as usize {
                let value = gray.get_pixel(x as u32, y as u32)[0];
                let is_foreground = match config.polarity {
                    MaskPolarity::Bright => value > config.threshold,
                    MaskPolarity::Dark => value <= config.threshold,
                };
                row_sum = row_sum.wrapping_add(is_foreground as u32);
                let above = integral[y * stride + x + 1];
                integral[(y + 1) * stride + x + 1] = above.wrapping_add(row_sum);
            }
        }

        Self {
            width,
            height,
            integral,
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn total(&self) -> u64 {
        self.count(0, 0, self.width, self.height)
    }

    /// Foreground pixels in the rectangle at `(x, y)` of size `w × h`, clipped to the mask.
    pub fn count(&self, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let x0 = x.min(self.width) as usize;
        let y0 = y.min(self.height) as usize;
        let x1 = x.saturating_add(w).min(self.width) as usize;
        let y1 = y.saturating_add(h).min(self.height) as usize;
        let stride = self.width as usize + 1;
        let at = |xx: usize, yy: usize| self.integral[yy * stride + xx];
        let count = at(x1, y1)
            .wrapping_add(at(x0, y0))
            .wrapping_sub(at(x0, y1))
            .wrapping_sub(at(x1, y0));
        count as u64
    }

    pub fn is_foreground(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.count(x, y, 1, 1) == 1
    }

    /// Centre of mass `(y, x)` of the foreground inside a rectangle, in absolute pixels.
    fn centroid(&self, x: u32, y: u32, w: u32, h: u32) -> Option<(f64, f64)> {
        let mut total = 0u64;
        let mut sum_y = 0f64;
        let mut sum_x = 0f64;
        for yy in y..(y + h).min(self.height) {
            for xx in x..(x + w).min(self.width) {
                if self.count(xx, yy, 1, 1) == 1 {
                    total += 1;
                    sum_y += yy as f64;
                    sum_x += xx as f64;
                }
            }
        }
        (total > 0).then(|| (sum_y / total as f64, sum_x / total as f64))
    }
}

/// A kept tile of the grid.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub row: usize,
    pub col: usize,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Fraction of the tile that is foreground.
    pub density: f64,
    /// Foreground centre of mass `(y, x)` in absolute pixels.
    pub centroid: (f64, f64),
}

/// Splits one axis of `len` pixels into `(start, length)` spans.
pub fn axis_spans(len: u32, tile_size: u32, edge_overlap: u32) -> Vec<(u32, u32)> {
    if len == 0 || tile_size == 0 {
        return Vec::new();
    }
    let full = len / tile_size;
    let remainder = len % tile_size;
    if full == 0 {
        return vec![(0, len)];
    }

    let mut spans: Vec<(u32, u32)> = (0..full).map(|i| (i * tile_size, tile_size)).collect();
    if remainder > 0 {
        let fraction = remainder as f64 / tile_size as f64;
        if fraction < edge_overlap as f64 / 100.0 {
            if let Some(last) = spans.last_mut() {
                last.1 += remainder;
            }
        } else {
            spans.push((full * tile_size, remainder));
        }
    }
    spans
}

/// The tiled view of a mask for one patch profile.
pub struct TileGrid<'a> {
    mask: &'a ForegroundMask,
    row_spans: Vec<(u32, u32)>,
    col_spans: Vec<(u32, u32)>,
    keep_fraction: f64,
}

impl<'a> TileGrid<'a> {
    pub fn new(mask: &'a ForegroundMask, patch: &PatchConfig) -> Self {
        let (width, height) = mask.dimensions();
        Self {
            mask,
            row_spans: axis_spans(height, patch.tile_size, patch.edge_overlap),
            col_spans: axis_spans(width, patch.tile_size, patch.edge_overlap),
            keep_fraction: patch.tile_keep_percentage / 100.0,
        }
    }

    pub fn tile_count(&self) -> usize {
        self.row_spans.len() * self.col_spans.len()
    }

    /// Tiles whose foreground fraction reaches the keep threshold, row-major.
    pub fn kept_tiles(&self) -> Vec<Tile> {
        let mut kept = Vec::new();
        for (row, &(y, height)) in self.row_spans.iter().enumerate() {
            for (col, &(x, width)) in self.col_spans.iter().enumerate() {
                let foreground = self.mask.count(x, y, width, height);
                if foreground == 0 {
                    continue;
                }
                let density = foreground as f64 / (width as u64 * height as u64) as f64;
                if density < self.keep_fraction {
                    continue;
                }
                if let Some(centroid) = self.mask.centroid(x, y, width, height) {
                    kept.push(Tile {
                        row,
                        col,
                        x,
                        y,
                        width,
                        height,
                        density,
                        centroid,
                    });
                }
            }
        }
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn mask_from_fn(width: u32, height: u32, f: impl Fn(u32, u32) -> bool) -> ForegroundMask {
        let gray = GrayImage::from_fn(width, height, |x, y| Luma([if f(x, y) { 255 } else { 0 }]));
        ForegroundMask::from_gray(&gray, &MaskConfig::default())
    }

    #[test]
    fn summed_area_counts_rectangles() {
        let mask = mask_from_fn(10, 6, |x, _| x < 4);
        assert_eq!(mask.total(), 24);
        assert_eq!(mask.count(0, 0, 2, 2), 4);
        assert_eq!(mask.count(3, 0, 4, 6), 6);
        assert_eq!(mask.count(8, 4, 10, 10), 0);
        assert!(mask.is_foreground(3, 5));
        assert!(!mask.is_foreground(4, 5));
        assert!(!mask.is_foreground(40, 5));
    }

    #[test]
    fn counts_survive_prefix_sums_wrapping() {
        let mut mask = mask_from_fn(10, 6, |x, y| (x + y) % 3 == 0);
        let expected = [mask.total(), mask.count(2, 1, 5, 4), mask.count(9, 5, 1, 1)];
        assert_eq!(std::mem::size_of_val(&mask.integral[0]), 4);

        // Every rectangle count is a difference of four sums, so a shared offset
        // that pushes the sums past u32::MAX must not change any count.
        for sum in &mut mask.integral {
            *sum = sum.wrapping_add(u32::MAX - 5);
        }
        let shifted = [mask.total(), mask.count(2, 1, 5, 4), mask.count(9, 5, 1, 1)];
        assert_eq!(shifted, expected);
    }

    #[test]
    fn dark_polarity_inverts_foreground() {
        let gray = GrayImage::from_fn(4, 4, |x, _| Luma([if x < 1 { 255 } else { 0 }]));
        let config = MaskConfig {
            polarity: MaskPolarity::Dark,
            ..MaskConfig::default()
        };
        assert_eq!(ForegroundMask::from_gray(&gray, &config).total(), 12);
    }

    #[test]
    fn short_remainder_is_absorbed_long_remainder_is_an_edge_tile() {
        // 2.5 tiles: a 50% remainder is below a 75% overlap, so it is absorbed.
        assert_eq!(axis_spans(250, 100, 75), vec![(0, 100), (100, 150)]);
        // 2.8 tiles: an 80% remainder is its own edge tile.
        assert_eq!(axis_spans(280, 100, 75), vec![(0, 100), (100, 100), (200, 80)]);
        assert_eq!(axis_spans(200, 100, 75), vec![(0, 100), (100, 100)]);
        assert_eq!(axis_spans(60, 100, 75), vec![(0, 60)]);
        assert!(axis_spans(0, 100, 75).is_empty());
    }

    #[test]
    fn keeps_dense_tiles_with_their_centroids() {
        // Left half is tissue; with 32px tiles on a 64x64 mask only the left column survives.
        let mask = mask_from_fn(64, 64, |x, _| x < 32);
        let patch = PatchConfig {
            tile_size: 32,
            tile_keep_percentage: 35.0,
            ..PatchConfig::default()
        };
        let grid = TileGrid::new(&mask, &patch);
        assert_eq!(grid.tile_count(), 4);

        let kept = grid.kept_tiles();
        assert_eq!(kept.len(), 2);
        assert_eq!((kept[0].row, kept[0].col), (0, 0));
        assert_eq!((kept[1].row, kept[1].col), (1, 0));
        assert_eq!(kept[0].density, 1.0);
        assert_eq!(kept[0].centroid, (15.5, 15.5));
        assert_eq!(kept[1].centroid, (47.5, 15.5));
    }

    #[test]
    fn sparse_tiles_are_dropped() {
        let mask = mask_from_fn(32, 32, |x, y| x < 4 && y < 4);
        let patch = PatchConfig {
            tile_size: 32,
            tile_keep_percentage: 35.0,
            ..PatchConfig::default()
        };
        assert!(TileGrid::new(&mask, &patch).kept_tiles().is_empty());
    }
}
