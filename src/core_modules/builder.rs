// THEORY:
// The `ArtifactBuilder` turns one manifest record into one `BinaryArtifact`. It
// is a pure function of the record, the configuration and the bytes on disk: it
// holds no state between records, so any number of builds may run side by side
// on blocking threads.
//
// The build is a short funnel, and each stage can reject the record:
// 1.  **Load**: resolve and decode the raw inputs (`raw_inputs`). Missing files,
//     undecodable images, malformed tables and incompatible masks stop here.
// 2.  **Locate**: tile the mask and keep the tiles with enough tissue (`tile_grid`).
// 3.  **Sample**: draw seeded Gaussian patch sequences around each tile's
//     centroid (`sampler`).
// 4.  **Extract**: crop and downscale every patch, and summarize the cells whose
//     centroids fall inside it into a fixed-length feature vector.
//
// A record that survives the funnel but produces no sequence is an
// `EmptyRegionError`: an artifact with nothing in it would be indistinguishable
// from a failure downstream.

use crate::config::{PatchConfig, PrepConfig};
use crate::core_modules::artifact::{ArtifactStats, BinaryArtifact, PatchSequence, PatchStep};
use crate::core_modules::detections::DetectionTable;
use crate::core_modules::raw_inputs::RawInputs;
use crate::core_modules::record::ImageRecord;
use crate::core_modules::sampler::{self, Origin};
use crate::core_modules::tile_grid::{ForegroundMask, Tile, TileGrid};
use crate::error::RecordError;
use image::RgbImage;
use image::imageops::{self, FilterType};
use std::sync::Arc;
use tracing::debug;

pub struct ArtifactBuilder {
    config: Arc<PrepConfig>,
}

impl ArtifactBuilder {
    pub fn new(config: Arc<PrepConfig>) -> Self {
        Self { config }
    }

    /// Length of every step's feature vector: the cell count plus one mean per feature column.
    pub fn feature_len(&self) -> usize {
        1 + self.config.detections.feature_columns.len()
    }

    pub fn build(&self, record: &ImageRecord) -> Result<BinaryArtifact, RecordError> {
        let key = record.identity_key();
        let patch = self.config.patch_for_source(&record.source);

        // --- 1. Load ---
        let inputs = RawInputs::load(record, &self.config, patch)?;
        if inputs.mask.total() == 0 {
            return Err(RecordError::EmptyRegion {
                detail: "mask has no foreground after thresholding".to_string(),
            });
        }

        // --- 2. Locate ---
        let grid = TileGrid::new(&inputs.mask, patch);
        let tiles = grid.kept_tiles();
        if tiles.is_empty() {
            return Err(RecordError::EmptyRegion {
                detail: format!(
                    "none of {} tiles reaches {}% foreground",
                    grid.tile_count(),
                    patch.tile_keep_percentage
                ),
            });
        }
        let tiles_without_cells = tiles
            .iter()
            .filter(|tile| !tile_has_cells(tile, &inputs.mask, &inputs.detections))
            .count();

        // --- 3. Sample ---
        let origins = sampler::sample_sequences(&inputs.mask, &tiles, patch, key.seed());
        if origins.is_empty() {
            return Err(RecordError::EmptyRegion {
                detail: format!(
                    "{} kept tiles but no {}-step sequence of patches with {}% foreground",
                    tiles.len(),
                    patch.num_steps,
                    patch.patch_keep_percentage
                ),
            });
        }

        // --- 4. Extract ---
        let feature_columns = self.config.detections.feature_columns.len();
        let sequences: Vec<PatchSequence> = origins
            .iter()
            .map(|sequence| PatchSequence {
                steps: sequence
                    .iter()
                    .map(|&origin| {
                        let detections = &inputs.detections;
                        extract_step(&inputs.image, detections, origin, patch, feature_columns)
                    })
                    .collect(),
            })
            .collect();

        debug!(
            "Built {}: {} tiles kept ({} without cells), {} sequences",
            key,
            tiles.len(),
            tiles_without_cells,
            sequences.len()
        );

        Ok(BinaryArtifact {
            key,
            condition: record.condition,
            num_steps: patch.num_steps as u16,
            sample_size: patch.sample_size as u16,
            feature_len: self.feature_len() as u16,
            stats: ArtifactStats {
                rows_parsed: inputs.detections.rows_parsed,
                rows_skipped: inputs.detections.rows_skipped,
                kept_tiles: tiles.len() as u32,
                tiles_without_cells: tiles_without_cells as u32,
            },
            sequences,
        })
    }
}

/// True when some annotated cell centroid lies on the tile's foreground.
fn tile_has_cells(tile: &Tile, mask: &ForegroundMask, detections: &DetectionTable) -> bool {
    let (x0, y0) = (tile.x as f64, tile.y as f64);
    let (x1, y1) = (x0 + tile.width as f64, y0 + tile.height as f64);
    detections
        .cells_in(x0, y0, x1, y1)
        .any(|cell| mask.is_foreground(cell.x as u32, cell.y as u32))
}

fn extract_step(
    image: &RgbImage,
    detections: &DetectionTable,
    (y, x): Origin,
    patch: &PatchConfig,
    feature_columns: usize,
) -> PatchStep {
    let size = patch.patch_size;
    let crop = imageops::crop_imm(image, x, y, size, size).to_image();
    let pixels = if patch.sample_size == size {
        crop.into_raw()
    } else {
        imageops::resize(&crop, patch.sample_size, patch.sample_size, FilterType::Triangle)
            .into_raw()
    };

    let (x0, y0) = (x as f64, y as f64);
    let mut count = 0usize;
    let mut sums = vec![0f64; feature_columns];
    for cell in detections.cells_in(x0, y0, x0 + size as f64, y0 + size as f64) {
        count += 1;
        for (sum, value) in sums.iter_mut().zip(&cell.features) {
            *sum += *value as f64;
        }
    }
    // Patches without cells keep the fixed feature length, with zero means.
    let mut features = Vec::with_capacity(1 + feature_columns);
    features.push(count as f32);
    features.extend(
        sums.iter()
            .map(|sum| if count == 0 { 0.0 } else { (sum / count as f64) as f32 }),
    );

    PatchStep {
        y,
        x,
        pixels,
        features,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::detections::Cell;
    use crate::core_modules::record::{Condition, Mode};
    use crate::error::ErrorKind;
    use image::{GrayImage, Luma, Rgb};
    use std::fs;
    use std::path::Path;

    fn small_config(root: &Path) -> PrepConfig {
        let mut config = PrepConfig::rooted_at(root);
        config.patch = PatchConfig {
            patch_size: 8,
            tile_size: 32,
            sample_size: 4,
            max_std_dev: 12.0,
            num_steps: 2,
            ..PatchConfig::default()
        };
        for dir in [&config.images_dir, &config.mask_dir, &config.detections_dir] {
            fs::create_dir_all(dir).unwrap();
        }
        config
    }

    fn write_inputs(config: &PrepConfig, stem: &str, mask_value: u8) {
        RgbImage::from_fn(64, 64, |x, y| Rgb([x as u8 * 4, y as u8 * 4, 128]))
            .save(config.images_dir.join(format!("{stem}.tif")))
            .unwrap();
        GrayImage::from_pixel(64, 64, Luma([mask_value]))
            .save(config.mask_dir.join(format!("mask_{stem}.tif")))
            .unwrap();
        let mut table = String::from(concat!(
            "Centroid X µm\tCentroid Y µm\tNucleus: Area\tNucleus: Perimeter\t",
            "Nucleus: Circularity\tNucleus: Eccentricity\n",
        ));
        for i in 0..16 {
            table.push_str(&format!("{}\t{}\t30.0\t20.0\t0.8\t0.4\n", 4 * i, 4 * i));
        }
        table.push_str("NaN\t3\t1\t1\t1\t1\n");
        let detections = config.detections_dir.join(format!("{stem}_Detectionstxt.txt"));
        fs::write(detections, table).unwrap();
    }

    fn record(image: &str) -> ImageRecord {
        ImageRecord {
            row: 2,
            mode: Mode::Train,
            subject: "00-00".to_string(),
            image: image.to_string(),
            condition: Condition::Recurrence,
            source: "CUMC".to_string(),
        }
    }

    #[test]
    fn builds_deterministic_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        write_inputs(&config, "00_00_00", 255);
        let builder = ArtifactBuilder::new(Arc::new(config));

        let artifact = builder.build(&record("00_00_00.tif")).unwrap();
        assert_eq!(artifact.condition, Condition::Recurrence);
        assert_eq!(artifact.stats.rows_parsed, 16);
        assert_eq!(artifact.stats.rows_skipped, 1);
        assert_eq!(artifact.stats.kept_tiles, 4);
        assert!(!artifact.sequences.is_empty());
        for step in artifact.sequences.iter().flat_map(|sequence| &sequence.steps) {
            assert_eq!(step.pixels.len(), 4 * 4 * 3);
            assert_eq!(step.features.len(), 5);
        }

        let again = builder.build(&record("00_00_00.tif")).unwrap();
        assert_eq!(artifact.encode(), again.encode());
    }

    #[test]
    fn all_background_mask_is_an_empty_region() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        write_inputs(&config, "00_00_00", 0);
        let builder = ArtifactBuilder::new(Arc::new(config));

        let err = builder.build(&record("00_00_00.tif")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EmptyRegion);
    }

    fn cell(x: f64, y: f64, area: f32) -> Cell {
        Cell {
            x,
            y,
            features: vec![area],
        }
    }

    #[test]
    fn patch_features_average_the_cells_inside() {
        let image = RgbImage::from_pixel(16, 16, Rgb([10, 20, 30]));
        let detections = DetectionTable {
            cells: vec![
                cell(1.0, 1.0, 10.0),
                cell(3.0, 2.0, 20.0),
                cell(12.0, 12.0, 99.0),
            ],
            rows_parsed: 3,
            rows_skipped: 0,
        };
        let patch = PatchConfig {
            patch_size: 8,
            sample_size: 4,
            ..PatchConfig::default()
        };

        let step = extract_step(&image, &detections, (0, 0), &patch, 1);
        assert_eq!(step.features, vec![2.0, 15.0]);
        assert_eq!(&step.pixels[..3], &[10, 20, 30]);

        let empty = extract_step(&image, &detections, (0, 8), &patch, 1);
        assert_eq!(empty.features, vec![0.0, 0.0]);
    }
}
