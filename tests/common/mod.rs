#![allow(dead_code)]

use image::{GrayImage, Luma, Rgb, RgbImage};
use recurrence_prep::PrepConfig;
use recurrence_prep::config::PatchConfig;
use std::fs;
use std::path::{Path, PathBuf};

/// A study folder with the standard layout and a small patch geometry.
pub struct Study {
    pub dir: tempfile::TempDir,
    pub config: PrepConfig,
}

impl Study {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = PrepConfig::rooted_at(dir.path());
        config.workers = Some(3);
        config.patch = PatchConfig {
            patch_size: 8,
            tile_size: 32,
            sample_size: 4,
            max_std_dev: 12.0,
            num_steps: 2,
            ..PatchConfig::default()
        };
        for path in [&config.images_dir, &config.mask_dir, &config.detections_dir] {
            fs::create_dir_all(path).expect("create input dir");
        }
        Self { dir, config }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Writes a 64x64 slide, an all-tissue mask and a detection table for `image`.
    pub fn add_slide(&self, image: &str) {
        let stem = image.trim_end_matches(".tif");
        let shade = stem.bytes().fold(0u8, |acc, b| acc.wrapping_add(b));
        RgbImage::from_fn(64, 64, |x, y| Rgb([x as u8 * 4, y as u8 * 4, shade]))
            .save(self.config.images_dir.join(image))
            .expect("write slide");
        self.add_mask(stem, GrayImage::from_pixel(64, 64, Luma([255])));
        self.add_detections(stem);
    }

    pub fn add_mask(&self, stem: &str, mask: GrayImage) {
        mask.save(self.config.mask_dir.join(format!("mask_{stem}.tif")))
            .expect("write mask");
    }

    pub fn remove_mask(&self, stem: &str) {
        fs::remove_file(self.config.mask_dir.join(format!("mask_{stem}.tif")))
            .expect("remove mask");
    }

    pub fn add_detections(&self, stem: &str) {
        let mut table = String::from(concat!(
            "Image\tCentroid X µm\tCentroid Y µm\tNucleus: Area\tNucleus: Perimeter\t",
            "Nucleus: Circularity\tNucleus: Eccentricity\n",
        ));
        for i in 0..20 {
            let (x, y) = (3 * i + 1, 60 - 3 * i);
            table.push_str(&format!("{stem}\t{x}\t{y}\t{}\t18.5\t0.82\t0.37\n", 20 + i));
        }
        fs::write(
            self.config.detections_dir.join(format!("{stem}_Detectionstxt.txt")),
            table,
        )
        .expect("write detections");
    }

    pub fn write_manifest(&self, rows: &[(&str, &str, &str, u8, &str)]) -> PathBuf {
        let mut body = String::from("mode,subject,image,label,source\n");
        for (mode, subject, image, label, source) in rows {
            body.push_str(&format!("{mode},{subject},{image},{label},{source}\n"));
        }
        let path = self.root().join("image_list.csv");
        fs::write(&path, body).expect("write manifest");
        path
    }

    pub fn output(&self, file: &str) -> PathBuf {
        self.config.output_dir.join(file)
    }
}

pub const CONDITION_FILES: [&str; 6] = [
    "recurrence_train.bin",
    "nonrecurrence_train.bin",
    "recurrence_valid.bin",
    "nonrecurrence_valid.bin",
    "recurrence_test.bin",
    "nonrecurrence_test.bin",
];
