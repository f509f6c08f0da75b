// THEORY:
// The `ArtifactCache` makes artifact construction a one-time cost. Building an
// artifact decodes a whole slide and samples thousands of patches, so the
// encoded result is kept on disk under a path derived only from the identity
// key, and every later request for that key is a file read.
//
// Key architectural principles:
// 1.  **Content-free addressing**: the path is `<root>/<h[0..2]>/<h>.bin` where `h`
//     is the hex SHA-256 of (subject, image). Changing the raw inputs does not
//     change the path, so stale entries must be cleared by hand.
// 2.  **Per-key exclusion**: concurrent requests for the same key serialize on a
//     lock owned by that key alone. The first builds, the rest find the entry
//     on disk. Requests for different keys never wait on each other.
// 3.  **Atomic persistence**: an entry is written to a temporary file in the
//     destination directory and renamed into place, so a reader never sees a
//     partial artifact.
// 4.  **Handles, not tensors**: callers get a `CachedArtifact` naming the verified
//     file on disk. The decoded artifact is dropped as soon as it has been
//     checked, so a run holds at most one artifact per busy worker in memory.

use crate::core_modules::artifact::BinaryArtifact;
use crate::core_modules::builder::ArtifactBuilder;
use crate::core_modules::record::{Condition, IdentityKey, ImageRecord};
use crate::error::{CodecError, RecordError};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Hit and build counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub builds: u64,
}

/// A verified cache entry. `len` is the exact size of the encoded artifact at `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedArtifact {
    pub key: IdentityKey,
    /// The label the entry was built with.
    pub condition: Condition,
    pub path: PathBuf,
    pub len: u64,
}

impl CachedArtifact {
    pub fn read(&self) -> Result<BinaryArtifact, CodecError> {
        BinaryArtifact::decode(&fs::read(&self.path)?)
    }
}

pub struct ArtifactCache {
    root: PathBuf,
    builder: ArtifactBuilder,
    key_locks: Mutex<HashMap<IdentityKey, Arc<Mutex<()>>>>,
    hits: AtomicU64,
    builds: AtomicU64,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>, builder: ArtifactBuilder) -> Self {
        Self {
            root: root.into(),
            builder,
            key_locks: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            builds: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &IdentityKey) -> PathBuf {
        let hex = key.digest_hex();
        self.root.join(&hex[..2]).join(format!("{hex}.bin"))
    }

    /// Returns the cache entry for `record`, building and persisting it on a miss.
    pub fn get_or_build(&self, record: &ImageRecord) -> Result<CachedArtifact, RecordError> {
        let key = record.identity_key();
        let lock = self.lock_for(&key);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let path = self.path_for(&key);
        if let Some((condition, len)) = self.load(&path, &key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache hit for {}", key);
            return Ok(CachedArtifact {
                key,
                condition,
                path,
                len,
            });
        }

        let artifact = self.builder.build(record)?;
        let bytes = artifact.encode();
        persist(&path, &bytes).map_err(|source| RecordError::CacheIo {
            path: path.clone(),
            source,
        })?;
        self.builds.fetch_add(1, Ordering::Relaxed);
        debug!("Cached {} at {}", key, path.display());
        Ok(CachedArtifact {
            key,
            condition: artifact.condition,
            path,
            len: bytes.len() as u64,
        })
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
        }
    }

    fn lock_for(&self, key: &IdentityKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(key.clone()).or_default().clone()
    }

    /// Verifies an entry and returns its label and length. A missing file is a
    /// miss; an unreadable or corrupt one is logged and treated as a miss so it
    /// gets rebuilt.
    fn load(&self, path: &Path, key: &IdentityKey) -> Option<(Condition, u64)> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!("Cannot read cached artifact {}: {}; rebuilding", path.display(), err);
                return None;
            }
        };
        match BinaryArtifact::decode(&bytes) {
            Ok(artifact) if artifact.key == *key => Some((artifact.condition, bytes.len() as u64)),
            Ok(artifact) => {
                warn!(
                    "Cached artifact {} belongs to {}, not {}; rebuilding",
                    path.display(),
                    artifact.key,
                    key
                );
                None
            }
            Err(err) => {
                warn!("Corrupt cached artifact {}: {}; rebuilding", path.display(), err);
                None
            }
        }
    }
}

fn persist(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "cache path has no parent directory")
    })?;
    fs::create_dir_all(dir)?;
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PatchConfig, PrepConfig};
    use crate::core_modules::record::{Condition, Mode};
    use image::{GrayImage, Luma, RgbImage, Rgb};
    use std::thread;

    fn setup(root: &Path) -> Arc<PrepConfig> {
        let mut config = PrepConfig::rooted_at(root);
        config.detections.feature_columns = vec!["Nucleus: Area".to_string()];
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
        RgbImage::from_pixel(32, 32, Rgb([200, 100, 50]))
            .save(config.images_dir.join("00_00_00.tif"))
            .unwrap();
        GrayImage::from_pixel(32, 32, Luma([255]))
            .save(config.mask_dir.join("mask_00_00_00.tif"))
            .unwrap();
        fs::write(
            config.detections_dir.join("00_00_00_Detectionstxt.txt"),
            "Centroid X µm\tCentroid Y µm\tNucleus: Area\n4\t4\t25\n20\t20\t35\n",
        )
        .unwrap();
        Arc::new(config)
    }

    fn record() -> ImageRecord {
        ImageRecord {
            row: 2,
            mode: Mode::Train,
            subject: "00-00".to_string(),
            image: "00_00_00.tif".to_string(),
            condition: Condition::Nonrecurrence,
            source: "CUMC".to_string(),
        }
    }

    #[test]
    fn path_is_sharded_by_digest_prefix() {
        let cache = ArtifactCache::new(
            "/cache",
            ArtifactBuilder::new(Arc::new(PrepConfig::rooted_at("/data"))),
        );
        let key = IdentityKey::new("00-00", "00_00_00.tif");
        let hex = key.digest_hex();
        assert_eq!(
            cache.path_for(&key),
            PathBuf::from(format!("/cache/{}/{}.bin", &hex[..2], hex))
        );
    }

    #[test]
    fn second_request_is_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let cache = ArtifactCache::new(&config.cache_dir, ArtifactBuilder::new(config.clone()));

        let first = cache.get_or_build(&record()).unwrap();
        let second = cache.get_or_build(&record()).unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.stats(), CacheStats { hits: 1, builds: 1 });
        assert_eq!(second.path, cache.path_for(&record().identity_key()));
        assert_eq!(second.len, fs::metadata(&second.path).unwrap().len());
        assert_eq!(second.condition, Condition::Nonrecurrence);
    }

    #[test]
    fn concurrent_requests_for_one_key_build_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let cache = Arc::new(ArtifactCache::new(
            &config.cache_dir,
            ArtifactBuilder::new(config.clone()),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || cache.get_or_build(&record()).map(|entry| entry.read()))
            })
            .collect();
        let encoded: Vec<_> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap().unwrap())
            .collect();

        assert!(encoded.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(cache.stats(), CacheStats { hits: 7, builds: 1 });
    }

    #[test]
    fn corrupt_entry_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let cache = ArtifactCache::new(&config.cache_dir, ArtifactBuilder::new(config.clone()));

        let path = cache.path_for(&record().identity_key());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"RSQA garbage").unwrap();

        let entry = cache.get_or_build(&record()).unwrap();
        assert_eq!(cache.stats().builds, 1);
        assert_eq!(entry.read().unwrap().key, record().identity_key());
    }

    #[test]
    fn entry_with_impossible_header_sizes_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let config = setup(dir.path());
        let cache = ArtifactCache::new(&config.cache_dir, ArtifactBuilder::new(config.clone()));

        // A header claiming u16::MAX steps, patch side and features, and u32::MAX sequences.
        let mut header = Vec::new();
        header.extend_from_slice(b"RSQA");
        header.extend_from_slice(&1u16.to_le_bytes());
        header.push(0);
        for text in ["00-00", "00_00_00.tif"] {
            header.extend_from_slice(&(text.len() as u16).to_le_bytes());
            header.extend_from_slice(text.as_bytes());
        }
        header.extend_from_slice(&u16::MAX.to_le_bytes());
        header.extend_from_slice(&u16::MAX.to_le_bytes());
        header.push(3);
        header.extend_from_slice(&u16::MAX.to_le_bytes());
        header.extend_from_slice(&[0; 16]);
        header.extend_from_slice(&u32::MAX.to_le_bytes());

        let path = cache.path_for(&record().identity_key());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, &header).unwrap();

        let entry = cache.get_or_build(&record()).unwrap();
        assert_eq!(cache.stats(), CacheStats { hits: 0, builds: 1 });
        assert_eq!(entry.read().unwrap().num_steps, 2);
    }
}
