// THEORY:
// `RawInputs` is the triple a record points at on disk: the H&E image, its
// binary mask, and its cell detection table. None of them is named in the
// manifest except the image; the other two are found by naming convention.
// This module resolves that convention, reports every missing file at once, and
// hands the builder inputs that already agree on one pixel grid.
//
// Masks are usually painted at a reduced resolution, so a mask of a different
// size is rescaled to the image (nearest neighbour keeps it binary). What cannot
// be reconciled by rescaling is a different aspect ratio: that mask belongs to a
// different crop, and the record is rejected.

use crate::config::{PatchConfig, PrepConfig};
use crate::core_modules::detections::DetectionTable;
use crate::core_modules::record::ImageRecord;
use crate::core_modules::tile_grid::ForegroundMask;
use crate::error::{InputKind, MissingInput, RecordError};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageError, ImageReader, Limits, Luma, RgbImage};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where the three inputs of a record are expected to live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInputPaths {
    pub image: PathBuf,
    pub mask: PathBuf,
    pub detections: PathBuf,
}

impl RawInputPaths {
    pub fn resolve(record: &ImageRecord, config: &PrepConfig) -> Self {
        let stem = record.stem();
        let naming = &config.naming;
        Self {
            image: config.images_dir.join(&record.image),
            mask: config.mask_dir.join(format!(
                "{}{}.{}",
                naming.mask_prefix, stem, naming.mask_extension
            )),
            detections: config
                .detections_dir
                .join(format!("{}{}", stem, naming.detections_suffix)),
        }
    }

    /// Fails with every missing input listed, not just the first.
    pub fn ensure_present(&self) -> Result<(), RecordError> {
        let missing: Vec<MissingInput> = [
            (InputKind::Image, &self.image),
            (InputKind::Mask, &self.mask),
            (InputKind::Detections, &self.detections),
        ]
        .into_iter()
        .filter(|(_, path)| !path.is_file())
        .map(|(kind, path)| MissingInput {
            kind,
            path: path.clone(),
        })
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(RecordError::MissingFile { missing })
        }
    }
}

/// Decoded inputs of one record, sharing the image's pixel grid.
pub struct RawInputs {
    pub image: RgbImage,
    pub mask: ForegroundMask,
    pub detections: DetectionTable,
}

impl RawInputs {
    pub fn load(
        record: &ImageRecord,
        config: &PrepConfig,
        patch: &PatchConfig,
    ) -> Result<Self, RecordError> {
        let paths = RawInputPaths::resolve(record, config);
        paths.ensure_present()?;

        let detections = DetectionTable::read(&paths.detections, &config.detections)?;
        let limits = decode_limits(config.max_decode_bytes);
        let image = decode(&paths.image, InputKind::Image, &limits)?.into_rgb8();
        let mask_rgb = decode(&paths.mask, InputKind::Mask, &limits)?.into_rgb8();

        let (width, height) = image.dimensions();
        if width as u64 * height as u64 > u32::MAX as u64 {
            return Err(RecordError::DimensionMismatch {
                detail: format!("image is {width}x{height}, more than {} pixels", u32::MAX),
            });
        }
        if width < patch.patch_size || height < patch.patch_size {
            return Err(RecordError::DimensionMismatch {
                detail: format!(
                    "image is {width}x{height}, smaller than one {0}x{0} patch",
                    patch.patch_size
                ),
            });
        }

        // The first channel carries the mask, whatever the file's colour type.
        let mask_gray = GrayImage::from_fn(mask_rgb.width(), mask_rgb.height(), |x, y| {
            Luma([mask_rgb.get_pixel(x, y)[0]])
        });
        let mask_gray = align_mask(mask_gray, (width, height), config.mask.max_aspect_deviation)?;
        let mask = ForegroundMask::from_gray(&mask_gray, &config.mask);

        Ok(Self {
            image,
            mask,
            detections,
        })
    }
}

/// Decoder limits for slides: no dimension cap, and an allocation cap only when configured.
pub fn decode_limits(max_decode_bytes: Option<u64>) -> Limits {
    let mut limits = Limits::no_limits();
    limits.max_alloc = max_decode_bytes;
    limits
}

fn decode(path: &Path, input: InputKind, limits: &Limits) -> Result<DynamicImage, RecordError> {
    let decode_error = |source: ImageError| RecordError::Decode {
        input,
        path: path.to_path_buf(),
        source,
    };
    let mut reader = ImageReader::open(path)
        .map_err(|err| decode_error(ImageError::IoError(err)))?
        .with_guessed_format()
        .map_err(|err| decode_error(ImageError::IoError(err)))?;
    reader.limits(limits.clone());
    reader.decode().map_err(decode_error)
}

/// Rescales `mask` onto the image grid, rejecting masks of another aspect ratio.
pub fn align_mask(
    mask: GrayImage,
    (width, height): (u32, u32),
    max_aspect_deviation: f64,
) -> Result<GrayImage, RecordError> {
    let (mask_width, mask_height) = mask.dimensions();
    if (mask_width, mask_height) == (width, height) {
        return Ok(mask);
    }
    if mask_width == 0 || mask_height == 0 {
        return Err(RecordError::DimensionMismatch {
            detail: format!("mask is {mask_width}x{mask_height}"),
        });
    }

    let image_aspect = width as f64 / height as f64;
    let mask_aspect = mask_width as f64 / mask_height as f64;
    let deviation = (image_aspect - mask_aspect).abs() / image_aspect;
    if deviation > max_aspect_deviation {
        return Err(RecordError::DimensionMismatch {
            detail: format!(
                "image is {width}x{height} but mask is {mask_width}x{mask_height} \
                 (aspect ratios differ by {:.1}%)",
                deviation * 100.0
            ),
        });
    }

    debug!(
        "Rescaling mask {}x{} to image grid {}x{}",
        mask_width, mask_height, width, height
    );
    Ok(imageops::resize(&mask, width, height, FilterType::Nearest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::record::{Condition, Mode};

    fn record(image: &str) -> ImageRecord {
        ImageRecord {
            row: 2,
            mode: Mode::Test,
            subject: "00-00".to_string(),
            image: image.to_string(),
            condition: Condition::Nonrecurrence,
            source: "CUMC".to_string(),
        }
    }

    #[test]
    fn resolves_default_naming_convention() {
        let config = PrepConfig::rooted_at("/data");
        let paths = RawInputPaths::resolve(&record("00_00_00.tif"), &config);
        assert_eq!(paths.image, PathBuf::from("/data/original_images/00_00_00.tif"));
        assert_eq!(paths.mask, PathBuf::from("/data/masks/mask_00_00_00.tif"));
        assert_eq!(
            paths.detections,
            PathBuf::from("/data/detections/00_00_00_Detectionstxt.txt")
        );
    }

    #[test]
    fn reports_every_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let config = PrepConfig::rooted_at(dir.path());
        std::fs::create_dir_all(&config.images_dir).unwrap();
        std::fs::write(config.images_dir.join("00_00_00.tif"), b"not really a tiff").unwrap();

        let err = RawInputPaths::resolve(&record("00_00_00.tif"), &config)
            .ensure_present()
            .unwrap_err();
        match err {
            RecordError::MissingFile { missing } => {
                let kinds: Vec<_> = missing.iter().map(|m| m.kind).collect();
                assert_eq!(kinds, vec![InputKind::Mask, InputKind::Detections]);
            }
            other => panic!("expected missing file error, got {other:?}"),
        }
    }

    #[test]
    fn decode_limit_comes_from_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slide.tif");
        RgbImage::from_pixel(64, 64, image::Rgb([1, 2, 3])).save(&path).unwrap();

        let decoded = decode(&path, InputKind::Image, &decode_limits(None)).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 64));

        // 64x64 RGB needs 12 KiB; a 1 KiB cap must reject it.
        let err = decode(&path, InputKind::Image, &decode_limits(Some(1024))).unwrap_err();
        assert!(matches!(
            err,
            RecordError::Decode { input: InputKind::Image, source: ImageError::Limits(_), .. }
        ));
    }

    #[test]
    fn default_configuration_decodes_without_an_allocation_cap() {
        let config = PrepConfig::rooted_at("/data");
        let limits = decode_limits(config.max_decode_bytes);
        assert_eq!(limits.max_alloc, None);
        assert_eq!(limits.max_image_width, None);
        assert_eq!(limits.max_image_height, None);
    }

    #[test]
    fn proportional_mask_is_rescaled() {
        let mask = GrayImage::from_pixel(16, 8, Luma([255]));
        let aligned = align_mask(mask, (64, 32), 0.02).unwrap();
        assert_eq!(aligned.dimensions(), (64, 32));
        assert!(aligned.pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn different_aspect_ratio_is_a_dimension_mismatch() {
        let mask = GrayImage::from_pixel(16, 16, Luma([255]));
        let err = align_mask(mask, (64, 32), 0.02).unwrap_err();
        assert!(matches!(err, RecordError::DimensionMismatch { .. }));
    }
}
