// THEORY:
// A `BinaryArtifact` is everything the sequence model ever sees of one image:
// a stack of patch sequences, each step holding the downscaled RGB patch and a
// small vector of cell statistics for the cells that fall inside it. It is
// written once by the cache and then copied verbatim into a condition binary
// file, so its encoding is the wire format of the whole system.
//
// Key principles:
// 1.  **Fixed trailing shape**: every step of every sequence has the same patch
//     size, channel count and feature length, recorded once in the header. Only
//     the number of sequences varies between images.
// 2.  **Self-describing**: the identity key and label travel with the tensor, so a
//     condition file can be audited without the manifest.
// 3.  **Deterministic bytes**: no timestamps, no map iteration, no padding of
//     unspecified content. Equal artifacts encode to equal bytes.

use crate::core_modules::codec::{ByteReader, put_str, put_u16, put_u32};
use crate::core_modules::record::{Condition, IdentityKey};
use crate::error::CodecError;

pub const ARTIFACT_MAGIC: [u8; 4] = *b"RSQA";
pub const ARTIFACT_VERSION: u16 = 1;
pub const CHANNELS: u8 = 3;

/// One patch of a sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchStep {
    /// Patch origin row in full-resolution image pixels.
    pub y: u32,
    /// Patch origin column in full-resolution image pixels.
    pub x: u32,
    /// `sample_size × sample_size × 3` RGB bytes, row-major.
    pub pixels: Vec<u8>,
    /// Cell count followed by the mean of each configured detection feature.
    pub features: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchSequence {
    pub steps: Vec<PatchStep>,
}

/// Build-time accounting carried in the artifact header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArtifactStats {
    pub rows_parsed: u32,
    pub rows_skipped: u32,
    pub kept_tiles: u32,
    /// Kept tiles whose foreground contains no annotated cell centroid.
    pub tiles_without_cells: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryArtifact {
    pub key: IdentityKey,
    pub condition: Condition,
    pub num_steps: u16,
    pub sample_size: u16,
    pub feature_len: u16,
    pub stats: ArtifactStats,
    pub sequences: Vec<PatchSequence>,
}

impl BinaryArtifact {
    pub fn label(&self) -> u8 {
        self.condition.label()
    }

    fn patch_len(&self) -> usize {
        self.sample_size as usize * self.sample_size as usize * CHANNELS as usize
    }

    pub fn encode(&self) -> Vec<u8> {
        let step_len = 8 + self.patch_len() + 4 * self.feature_len as usize;
        let steps = self.sequences.len() * self.num_steps as usize;
        let header_len = 64 + self.key.subject.len() + self.key.image.len();
        let mut out = Vec::with_capacity(header_len + steps * step_len);

        out.extend_from_slice(&ARTIFACT_MAGIC);
        put_u16(&mut out, ARTIFACT_VERSION);
        out.push(self.label());
        put_str(&mut out, &self.key.subject);
        put_str(&mut out, &self.key.image);
        put_u16(&mut out, self.num_steps);
        put_u16(&mut out, self.sample_size);
        out.push(CHANNELS);
        put_u16(&mut out, self.feature_len);
        put_u32(&mut out, self.stats.rows_parsed);
        put_u32(&mut out, self.stats.rows_skipped);
        put_u32(&mut out, self.stats.kept_tiles);
        put_u32(&mut out, self.stats.tiles_without_cells);
        put_u32(&mut out, self.sequences.len() as u32);

        for sequence in &self.sequences {
            for step in &sequence.steps {
                put_u32(&mut out, step.y);
                put_u32(&mut out, step.x);
                out.extend_from_slice(&step.pixels);
                for feature in &step.features {
                    out.extend_from_slice(&feature.to_le_bytes());
                }
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = ByteReader::new(bytes);
        let artifact = Self::read_from(&mut reader)?;
        match reader.remaining() {
            0 => Ok(artifact),
            extra => Err(CodecError::TrailingBytes(extra)),
        }
    }

    fn read_from(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        reader.magic(ARTIFACT_MAGIC)?;
        let version = reader.u16()?;
        if version != ARTIFACT_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let label = reader.u8()?;
        let condition = Condition::from_label(label).ok_or(CodecError::InvalidField {
            field: "label",
            value: label as u64,
        })?;
        let subject = reader.string("subject")?;
        let image = reader.string("image")?;
        let num_steps = reader.u16()?;
        let sample_size = reader.u16()?;
        let channels = reader.u8()?;
        if channels != CHANNELS {
            return Err(CodecError::InvalidField {
                field: "channels",
                value: channels as u64,
            });
        }
        let feature_len = reader.u16()?;
        let stats = ArtifactStats {
            rows_parsed: reader.u32()?,
            rows_skipped: reader.u32()?,
            kept_tiles: reader.u32()?,
            tiles_without_cells: reader.u32()?,
        };
        let sequence_count = reader.u32()?;

        if num_steps == 0 {
            return Err(CodecError::InvalidField {
                field: "num_steps",
                value: 0,
            });
        }

        // Header values may come from a damaged file; size the body without overflowing.
        let patch_len = sample_size as usize * sample_size as usize * CHANNELS as usize;
        let declared = (4 * feature_len as usize)
            .checked_add(8 + patch_len)
            .and_then(|step_len| step_len.checked_mul(num_steps as usize))
            .and_then(|sequence_len| sequence_len.checked_mul(sequence_count as usize))
            .ok_or(CodecError::InvalidField {
                field: "sequence count",
                value: sequence_count as u64,
            })?;
        if declared > reader.remaining() {
            return Err(CodecError::Truncated {
                needed: declared,
                offset: reader.position(),
            });
        }

        let mut sequences = Vec::with_capacity(sequence_count as usize);
        for _ in 0..sequence_count {
            let mut steps = Vec::with_capacity(num_steps as usize);
            for _ in 0..num_steps {
                let y = reader.u32()?;
                let x = reader.u32()?;
                let pixels = reader.take(patch_len)?.to_vec();
                let features = (0..feature_len)
                    .map(|_| reader.f32())
                    .collect::<Result<Vec<_>, _>>()?;
                steps.push(PatchStep {
                    y,
                    x,
                    pixels,
                    features,
                });
            }
            sequences.push(PatchSequence { steps });
        }

        Ok(Self {
            key: IdentityKey::new(subject, image),
            condition,
            num_steps,
            sample_size,
            feature_len,
            stats,
            sequences,
        })
    }
}
