// THEORY:
// `PrepConfig` is the single, explicit configuration value for a run. Nothing in
// the crate reads ambient process-wide state: the pipeline, the artifact
// builder, the cache and the vote aggregator each receive the parts of this
// value they need. It is deserialized from JSON so an external authoring tool can
// produce it; every tunable has a default matching the standard processing
// setup (500px patches on a 2500px tile grid, downscaled to 100px, 20-step
// sequences).

use crate::core_modules::record::Mode;
use crate::core_modules::vote::VoteReducer;
use crate::error::ConfigError;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Geometry and sampling parameters of the Gaussian patch sampler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchConfig {
    /// Side length in pixels of a patch cut from the full-resolution image.
    pub patch_size: u32,
    /// Side length in pixels of a mask tile used to locate tissue.
    pub tile_size: u32,
    /// Percent of a tile below which a trailing remainder strip is merged into the last full tile.
    pub edge_overlap: u32,
    /// Side length of a patch after downscaling; the stored tensor is `sample_size² × 3`.
    pub sample_size: u32,
    /// Percent of a patch that must be foreground for the patch to be accepted.
    pub patch_keep_percentage: f64,
    /// Percent of a tile that must be foreground for the tile to be sampled.
    pub tile_keep_percentage: f64,
    /// Gaussian standard deviation (pixels) used for a tile of 100% density.
    pub max_std_dev: f64,
    /// Number of sequences drawn from a tile of 100% density.
    pub max_sequences_per_tile: u32,
    /// Patches per sequence.
    pub num_steps: u32,
    /// Draw budget per requested patch before a tile gives up.
    pub max_sampling_attempts_per_patch: u32,
}

impl Default for PatchConfig {
    fn default() -> Self {
        let patch_size = 500;
        Self {
            patch_size,
            tile_size: patch_size * 5,
            edge_overlap: 75,
            sample_size: 100,
            patch_keep_percentage: 75.0,
            tile_keep_percentage: 35.0,
            max_std_dev: 1.5 * patch_size as f64,
            max_sequences_per_tile: 3,
            num_steps: 20,
            max_sampling_attempts_per_patch: 50,
        }
    }
}

impl PatchConfig {
    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let invalid =
            |what: &str| Err(ConfigError::Invalid(format!("patch profile '{name}': {what}")));
        if self.patch_size == 0 || self.tile_size == 0 || self.sample_size == 0 {
            return invalid("patch_size, tile_size and sample_size must be positive");
        }
        if self.sample_size > u16::MAX as u32 || self.num_steps > u16::MAX as u32 {
            return invalid("sample_size and num_steps must fit in 16 bits");
        }
        if self.num_steps == 0 {
            return invalid("num_steps must be positive");
        }
        if self.edge_overlap > 100 {
            return invalid("edge_overlap is a percentage (0-100)");
        }
        for (field, value) in [
            ("patch_keep_percentage", self.patch_keep_percentage),
            ("tile_keep_percentage", self.tile_keep_percentage),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return invalid(&format!("{field} is a percentage (0-100)"));
            }
        }
        if !self.max_std_dev.is_finite() || self.max_std_dev < 0.0 {
            return invalid("max_std_dev must be a non-negative number");
        }
        if self.max_sampling_attempts_per_patch == 0 {
            return invalid("max_sampling_attempts_per_patch must be positive");
        }
        Ok(())
    }
}

/// Which mask values count as tissue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskPolarity {
    /// Foreground is any value above the threshold.
    Bright,
    /// Foreground is any value at or below the threshold (masks painted white over background).
    Dark,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaskConfig {
    pub polarity: MaskPolarity,
    /// Binarization threshold applied to the mask's first channel.
    pub threshold: u8,
    /// Largest tolerated relative difference between image and mask aspect ratios.
    pub max_aspect_deviation: f64,
}

impl Default for MaskConfig {
    fn default() -> Self {
        Self {
            polarity: MaskPolarity::Bright,
            threshold: 0,
            max_aspect_deviation: 0.02,
        }
    }
}

/// Column layout of the tab-separated cell detection export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub centroid_x_column: String,
    pub centroid_y_column: String,
    /// Per-cell measurements averaged into each patch's feature vector.
    pub feature_columns: Vec<String>,
    /// Divisor converting centroid coordinates into image pixels.
    pub microns_per_pixel: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            centroid_x_column: "Centroid X µm".to_string(),
            centroid_y_column: "Centroid Y µm".to_string(),
            feature_columns: vec![
                "Nucleus: Area".to_string(),
                "Nucleus: Perimeter".to_string(),
                "Nucleus: Circularity".to_string(),
                "Nucleus: Eccentricity".to_string(),
            ],
            microns_per_pixel: 1.0,
        }
    }
}

/// File naming convention linking an image to its mask and detection table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    pub mask_prefix: String,
    pub mask_extension: String,
    pub detections_suffix: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            mask_prefix: "mask_".to_string(),
            mask_extension: "tif".to_string(),
            detections_suffix: "_Detectionstxt.txt".to_string(),
        }
    }
}

/// Top-level configuration for a preparation and voting run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepConfig {
    /// Directory holding the full-resolution H&E images named in the manifest.
    pub images_dir: PathBuf,
    /// Directory holding the binary masks.
    pub mask_dir: PathBuf,
    /// Directory holding the cell detection tables.
    pub detections_dir: PathBuf,
    /// Persistent artifact cache.
    pub cache_dir: PathBuf,
    /// Destination of the six condition binary files.
    pub output_dir: PathBuf,
    /// Error report path; defaults to `<output_dir>/errors.csv`.
    #[serde(default)]
    pub error_report: Option<PathBuf>,
    /// Voting report path; defaults to `<output_dir>/votes.csv`.
    #[serde(default)]
    pub vote_report: Option<PathBuf>,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub reducer: VoteReducer,
    /// Manifest modes whose records are built. Buckets of other modes are still written, empty.
    #[serde(default = "default_modes")]
    pub modes: Vec<Mode>,
    /// Worker pool size; defaults to the number of available CPUs.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Largest buffer a single slide or mask decode may allocate, in bytes. Unset
    /// means no limit; whole slides routinely exceed the decoder's own default.
    #[serde(default)]
    pub max_decode_bytes: Option<u64>,
    #[serde(default)]
    pub naming: NamingConfig,
    #[serde(default)]
    pub mask: MaskConfig,
    #[serde(default)]
    pub detections: DetectionConfig,
    #[serde(default)]
    pub patch: PatchConfig,
    /// Per-source overrides of `patch`, keyed by source tag. Keys are lowercased on load.
    #[serde(default, deserialize_with = "lowercase_keys")]
    pub patch_profiles: BTreeMap<String, PatchConfig>,
}

fn default_threshold() -> f64 {
    0.5
}

fn lowercase_keys<'de, D>(deserializer: D) -> Result<BTreeMap<String, PatchConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, PatchConfig>::deserialize(deserializer)?;
    let mut profiles = BTreeMap::new();
    for (source, profile) in raw {
        let key = source.to_lowercase();
        if profiles.insert(key.clone(), profile).is_some() {
            return Err(de::Error::custom(format!(
                "patch profile '{key}' is defined more than once"
            )));
        }
    }
    Ok(profiles)
}

fn default_modes() -> Vec<Mode> {
    Mode::ALL.to_vec()
}

impl PrepConfig {
    /// Builds a configuration following the standard on-disk layout of a single
    /// image data folder: `original_images/`, `masks/`, `detections/`,
    /// `image_bins/` for the cache and `condition_bins/` for the output.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            images_dir: root.join("original_images"),
            mask_dir: root.join("masks"),
            detections_dir: root.join("detections"),
            cache_dir: root.join("image_bins"),
            output_dir: root.join("condition_bins"),
            error_report: None,
            vote_report: None,
            threshold: default_threshold(),
            reducer: VoteReducer::default(),
            modes: default_modes(),
            workers: None,
            max_decode_bytes: None,
            naming: NamingConfig::default(),
            mask: MaskConfig::default(),
            detections: DetectionConfig::default(),
            patch: PatchConfig::default(),
            patch_profiles: BTreeMap::new(),
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.threshold.is_finite() || !(0.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::Invalid(format!(
                "threshold must lie in [0, 1], got {}",
                self.threshold
            )));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be positive".to_string()));
        }
        let microns_per_pixel = self.detections.microns_per_pixel;
        if !microns_per_pixel.is_finite() || microns_per_pixel <= 0.0 {
            return Err(ConfigError::Invalid(
                "detections.microns_per_pixel must be positive".to_string(),
            ));
        }
        if self.detections.feature_columns.len() >= u16::MAX as usize {
            return Err(ConfigError::Invalid(
                "detections.feature_columns is too long".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.mask.max_aspect_deviation) {
            return Err(ConfigError::Invalid(
                "mask.max_aspect_deviation must lie in [0, 1)".to_string(),
            ));
        }
        self.patch.validate("default")?;
        for (name, profile) in &self.patch_profiles {
            if *name != name.to_lowercase() {
                return Err(ConfigError::Invalid(format!(
                    "patch profile '{name}' must be keyed by its lowercase source tag"
                )));
            }
            profile.validate(name)?;
        }
        Ok(())
    }

    /// The patch parameters for a cohort, falling back to the default profile.
    pub fn patch_for_source(&self, source: &str) -> &PatchConfig {
        self.patch_profiles
            .get(&source.to_lowercase())
            .unwrap_or(&self.patch)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn error_report_path(&self) -> PathBuf {
        self.error_report
            .clone()
            .unwrap_or_else(|| self.output_dir.join("errors.csv"))
    }

    pub fn vote_report_path(&self) -> PathBuf {
        self.vote_report
            .clone()
            .unwrap_or_else(|| self.output_dir.join("votes.csv"))
    }

    pub fn processes(&self, mode: Mode) -> bool {
        self.modes.contains(&mode)
    }
}
