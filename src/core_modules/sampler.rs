// THEORY:
// The `sampler` places patches. For every kept tile it draws patch origins from
// a 2D Gaussian centred on the tile's tissue centroid, with a spread that grows
// with the tile's density: dense tissue is explored widely, a sliver of tissue
// is sampled tightly around its centre. Accepted origins are grouped into
// fixed-length sequences, the unit the downstream sequence model consumes.
//
// Key principles:
// 1.  **Seeded**: the RNG is seeded from the record's identity key. The same
//     inputs always give the same coordinates, which is what makes artifacts
//     byte-identical across runs.
// 2.  **Bounded**: rejection sampling can starve on awkward tissue shapes, so each
//     tile has a draw budget. A tile that runs out keeps only the full
//     sequences it managed to fill.
// 3.  **Top-left origins**: a sampled point is the top-left corner of its patch,
//     and a patch must lie entirely inside the image.

use crate::config::PatchConfig;
use crate::core_modules::tile_grid::{ForegroundMask, Tile};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::debug;

/// Patch origin `(y, x)` in image pixels.
pub type Origin = (u32, u32);

/// Draws sequences of patch origins for every tile, in tile order.
pub fn sample_sequences(
    mask: &ForegroundMask,
    tiles: &[Tile],
    patch: &PatchConfig,
    seed: u64,
) -> Vec<Vec<Origin>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (width, height) = mask.dimensions();
    let steps = patch.num_steps as usize;
    let patch_area = patch.patch_size as f64 * patch.patch_size as f64;
    let min_foreground = patch.patch_keep_percentage / 100.0 * patch_area;

    let mut sequences = Vec::new();
    for tile in tiles {
        let sequence_count =
            (tile.density * patch.max_sequences_per_tile as f64).round() as usize;
        if sequence_count == 0 {
            continue;
        }
        let target = sequence_count * steps;
        let budget = target * patch.max_sampling_attempts_per_patch as usize;
        let std_dev = patch.max_std_dev * tile.density;

        let mut origins = Vec::with_capacity(target);
        let mut draws = 0usize;
        while origins.len() < target && draws < budget {
            draws += 1;
            let dy: f64 = rng.sample(StandardNormal);
            let dx: f64 = rng.sample(StandardNormal);
            let y = (tile.centroid.0 + dy * std_dev).round();
            let x = (tile.centroid.1 + dx * std_dev).round();
            if y < 0.0 || x < 0.0 {
                continue;
            }
            let (y, x) = (y as u32, x as u32);
            if y as u64 + patch.patch_size as u64 > height as u64
                || x as u64 + patch.patch_size as u64 > width as u64
            {
                continue;
            }
            if (mask.count(x, y, patch.patch_size, patch.patch_size) as f64) < min_foreground {
                continue;
            }
            origins.push((y, x));
        }

        if origins.len() < target {
            debug!(
                "Tile ({}, {}) filled {} of {} patches after {} draws",
                tile.row,
                tile.col,
                origins.len(),
                target,
                draws
            );
        }
        sequences.extend(origins.chunks_exact(steps).map(<[Origin]>::to_vec));
    }
    sequences
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MaskConfig;
    use crate::core_modules::tile_grid::TileGrid;
    use image::{GrayImage, Luma};

    fn small_patch() -> PatchConfig {
        PatchConfig {
            patch_size: 8,
            tile_size: 32,
            sample_size: 4,
            max_std_dev: 12.0,
            num_steps: 2,
            ..PatchConfig::default()
        }
    }

    fn full_mask(width: u32, height: u32) -> ForegroundMask {
        ForegroundMask::from_gray(
            &GrayImage::from_pixel(width, height, Luma([255])),
            &MaskConfig::default(),
        )
    }

    #[test]
    fn same_seed_same_sequences() {
        let mask = full_mask(64, 64);
        let patch = small_patch();
        let tiles = TileGrid::new(&mask, &patch).kept_tiles();

        let first = sample_sequences(&mask, &tiles, &patch, 7);
        let second = sample_sequences(&mask, &tiles, &patch, 7);
        assert_eq!(first, second);
        // Four fully dense tiles, three sequences each.
        assert_eq!(first.len(), 12);
        assert!(first.iter().all(|sequence| sequence.len() == 2));
        assert_ne!(first, sample_sequences(&mask, &tiles, &patch, 8));
    }

    #[test]
    fn patches_stay_inside_the_image_and_on_tissue() {
        // Tissue only in the top-left 32x32 quadrant.
        let gray =
            GrayImage::from_fn(64, 64, |x, y| Luma([if x < 32 && y < 32 { 255 } else { 0 }]));
        let mask = ForegroundMask::from_gray(&gray, &MaskConfig::default());
        let patch = small_patch();
        let tiles = TileGrid::new(&mask, &patch).kept_tiles();
        assert_eq!(tiles.len(), 1);

        let sequences = sample_sequences(&mask, &tiles, &patch, 11);
        assert!(!sequences.is_empty());
        for &(y, x) in sequences.iter().flatten() {
            assert!(y + 8 <= 64 && x + 8 <= 64);
            let foreground = mask.count(x, y, 8, 8);
            assert!(
                foreground as f64 >= 0.75 * 64.0,
                "patch at ({y}, {x}) is mostly background"
            );
        }
    }

    #[test]
    fn impossible_patches_exhaust_the_budget() {
        // Patches larger than the image can never be accepted.
        let mask = full_mask(16, 16);
        let patch = PatchConfig {
            patch_size: 32,
            ..small_patch()
        };
        let tiles = TileGrid::new(&mask, &patch).kept_tiles();
        assert!(sample_sequences(&mask, &tiles, &patch, 1).is_empty());
    }

    #[test]
    fn offsets_spread_like_a_unit_normal() {
        // A large tile with tissue everywhere: accepted origins should sit around
        // the centroid with roughly the configured spread.
        let mask = full_mask(512, 512);
        let patch = PatchConfig {
            patch_size: 8,
            tile_size: 512,
            max_std_dev: 40.0,
            num_steps: 1,
            max_sequences_per_tile: 2000,
            ..small_patch()
        };
        let tiles = TileGrid::new(&mask, &patch).kept_tiles();
        assert_eq!(tiles.len(), 1);
        let (cy, cx) = tiles[0].centroid;

        let origins: Vec<Origin> = sample_sequences(&mask, &tiles, &patch, 3)
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(origins.len(), 2000);
        let n = origins.len() as f64;
        let mean_y = origins.iter().map(|&(y, _)| y as f64).sum::<f64>() / n;
        let var_x = origins
            .iter()
            .map(|&(_, x)| (x as f64 - cx).powi(2))
            .sum::<f64>()
            / n;
        assert!((mean_y - cy).abs() < 5.0, "mean row {mean_y} far from {cy}");
        assert!((var_x.sqrt() - 40.0).abs() < 5.0, "spread {} not near 40", var_x.sqrt());
    }
}
