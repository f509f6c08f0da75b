// THEORY:
// The `Partitioner` is the last stage of preparation. Workers finish records in
// any order; the partitioner collects each successful artifact under its
// (mode, condition) bucket, tagged with the record's manifest index, and at the
// end writes one condition binary file per bucket in manifest order.
//
// Key principles:
// 1.  **Total membership**: the six buckets exist from construction. A bucket that
//     never receives an artifact is still written, as a valid file with a count
//     of zero, so downstream training always finds all six files.
// 2.  **Order from the manifest, not the scheduler**: members are re-sorted by
//     manifest index before writing, which makes the files byte-identical across
//     runs no matter how the pool interleaved.
// 3.  **Isolated failure**: a bucket that cannot be written reports its own error;
//     the remaining buckets are still attempted.
// 4.  **Streamed from the cache**: members are cache handles, not tensors. Entry
//     bytes are copied from the cache file into the condition file, so memory
//     stays flat however large the study is.

use crate::core_modules::artifact::BinaryArtifact;
use crate::core_modules::artifact_cache::CachedArtifact;
use crate::core_modules::codec::{ByteReader, put_u16, put_u32};
use crate::core_modules::record::{Condition, ImageRecord, Mode};
use crate::error::{CodecError, PartitionError};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tempfile::NamedTempFile;
use tracing::{info, warn};

pub const CONDITION_MAGIC: [u8; 4] = *b"RSQC";
pub const CONDITION_VERSION: u16 = 1;

/// One of the six (mode, condition) partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Bucket {
    pub mode: Mode,
    pub condition: Condition,
}

impl Bucket {
    pub const ALL: [Bucket; 6] = [
        Bucket::new(Mode::Train, Condition::Recurrence),
        Bucket::new(Mode::Train, Condition::Nonrecurrence),
        Bucket::new(Mode::Valid, Condition::Recurrence),
        Bucket::new(Mode::Valid, Condition::Nonrecurrence),
        Bucket::new(Mode::Test, Condition::Recurrence),
        Bucket::new(Mode::Test, Condition::Nonrecurrence),
    ];

    pub const fn new(mode: Mode, condition: Condition) -> Self {
        Self { mode, condition }
    }

    pub fn for_record(record: &ImageRecord) -> Self {
        Self::new(record.mode, record.condition)
    }

    /// `{condition}_{mode}.bin`, e.g. `recurrence_train.bin`.
    pub fn file_name(&self) -> String {
        format!("{}_{}.bin", self.condition, self.mode)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.condition, self.mode)
    }
}

/// The outcome of writing one bucket.
#[derive(Debug)]
pub struct BucketReport {
    pub bucket: Bucket,
    pub path: PathBuf,
    pub count: usize,
    pub outcome: Result<(), PartitionError>,
}

impl BucketReport {
    pub fn is_written(&self) -> bool {
        self.outcome.is_ok()
    }
}

type Members = Vec<(usize, CachedArtifact)>;

pub struct Partitioner {
    buckets: Mutex<BTreeMap<Bucket, Members>>,
}

impl Default for Partitioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Partitioner {
    pub fn new() -> Self {
        let buckets = Bucket::ALL.iter().map(|&bucket| (bucket, Vec::new())).collect();
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    /// Adds the cache entry of the record at manifest position `index`.
    pub fn insert(&self, index: usize, record: &ImageRecord, entry: CachedArtifact) {
        if entry.condition != record.condition {
            // A shared cache entry carries the label it was built with; the
            // manifest row decides the bucket and the label written for it.
            warn!(
                "Row {}: cached artifact for {} is labelled {}, manifest says {}",
                record.row, entry.key, entry.condition, record.condition
            );
        }

        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        buckets
            .entry(Bucket::for_record(record))
            .or_default()
            .push((index, entry));
    }

    /// Partitions a complete list of (record, outcome) pairs, skipping failures.
    pub fn assign<'a, E>(
        &self,
        pairs: impl IntoIterator<Item = (&'a ImageRecord, &'a Result<CachedArtifact, E>)>,
    ) where
        E: 'a,
    {
        for (index, (record, outcome)) in pairs.into_iter().enumerate() {
            if let Ok(entry) = outcome {
                self.insert(index, record, entry.clone());
            }
        }
    }

    /// The cache entries of one bucket, in manifest order.
    pub fn members(&self, bucket: Bucket) -> Vec<CachedArtifact> {
        let buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
        let mut members = buckets.get(&bucket).cloned().unwrap_or_default();
        members.sort_by_key(|(index, _)| *index);
        members.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Writes all six condition files under `dir`, one report per bucket.
    pub fn write_all(&self, dir: &Path) -> Vec<BucketReport> {
        Bucket::ALL
            .iter()
            .map(|&bucket| {
                let members = self.members(bucket);
                let path = dir.join(bucket.file_name());
                let outcome = write_condition_file(&path, bucket, &members).map_err(|source| {
                    PartitionError::Io {
                        path: path.clone(),
                        source,
                    }
                });
                match &outcome {
                    Ok(()) => info!("Wrote {} with {} artifacts", path.display(), members.len()),
                    Err(err) => warn!("{}", err),
                }
                BucketReport {
                    bucket,
                    path,
                    count: members.len(),
                    outcome,
                }
            })
            .collect()
    }
}

fn write_condition_file(path: &Path, bucket: Bucket, members: &[CachedArtifact]) -> io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "condition file path has no parent")
    })?;
    fs::create_dir_all(dir)?;

    let mut header = Vec::with_capacity(12);
    header.extend_from_slice(&CONDITION_MAGIC);
    put_u16(&mut header, CONDITION_VERSION);
    header.push(bucket.mode.code());
    header.push(bucket.condition.label());
    put_u32(&mut header, members.len() as u32);

    let file = NamedTempFile::new_in(dir)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&header)?;
    for entry in members {
        if entry.condition == bucket.condition {
            copy_entry(entry, &mut writer)?;
        } else {
            let bytes = relabelled(entry, bucket.condition)?;
            writer.write_all(&(bytes.len() as u64).to_le_bytes())?;
            writer.write_all(&bytes)?;
        }
    }
    let file = writer.into_inner().map_err(|err| err.into_error())?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

/// Copies a cache entry's bytes verbatim, behind its length prefix.
fn copy_entry(entry: &CachedArtifact, writer: &mut impl Write) -> io::Result<()> {
    writer.write_all(&entry.len.to_le_bytes())?;
    let mut source = File::open(&entry.path)?.take(entry.len);
    let copied = io::copy(&mut source, writer)?;
    if copied != entry.len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "cache entry {} shrank from {} to {} bytes",
                entry.path.display(),
                entry.len,
                copied
            ),
        ));
    }
    Ok(())
}

/// Re-encodes an entry under the manifest's label.
fn relabelled(entry: &CachedArtifact, condition: Condition) -> io::Result<Vec<u8>> {
    let mut artifact = entry
        .read()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    artifact.condition = condition;
    Ok(artifact.encode())
}

/// A decoded condition binary file.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionFile {
    pub bucket: Bucket,
    pub artifacts: Vec<BinaryArtifact>,
}

pub fn read_condition_file(path: &Path) -> Result<ConditionFile, CodecError> {
    let bytes = fs::read(path)?;
    decode_condition_file(&bytes)
}

pub fn decode_condition_file(bytes: &[u8]) -> Result<ConditionFile, CodecError> {
    let mut reader = ByteReader::new(bytes);
    reader.magic(CONDITION_MAGIC)?;
    let version = reader.u16()?;
    if version != CONDITION_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    let mode_code = reader.u8()?;
    let mode = Mode::from_code(mode_code).ok_or(CodecError::InvalidField {
        field: "mode",
        value: mode_code as u64,
    })?;
    let label = reader.u8()?;
    let condition = Condition::from_label(label).ok_or(CodecError::InvalidField {
        field: "condition",
        value: label as u64,
    })?;
    let count = reader.u32()?;

    let mut artifacts = Vec::new();
    for _ in 0..count {
        let len = reader.u64()?;
        let len = usize::try_from(len).map_err(|_| CodecError::InvalidField {
            field: "artifact length",
            value: len,
        })?;
        artifacts.push(BinaryArtifact::decode(reader.take(len)?)?);
    }
    if reader.remaining() > 0 {
        return Err(CodecError::TrailingBytes(reader.remaining()));
    }

    Ok(ConditionFile {
        bucket: Bucket::new(mode, condition),
        artifacts,
    })
}
