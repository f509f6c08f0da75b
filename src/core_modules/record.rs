// THEORY:
// The `record` module holds the small, immutable vocabulary every other module
// speaks: the manifest `Mode`, the `Condition` derived from a label, the
// `IdentityKey` that names one raw image, and the `ImageRecord` itself.
//
// Key principles:
// 1.  **Closed domains**: modes and conditions are enums, so a value outside the
//     manifest's domain can only exist as a parse error, never as a record.
// 2.  **Identity is (subject, image)**: the mode is deliberately not part of the
//     key. The same image listed under two modes is one identity and shares one
//     cached artifact.
// 3.  **Stable digest**: the SHA-256 of the key drives both the cache path and the
//     sampler's RNG seed, so both are reproducible across runs and machines.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// The manifest partition a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    Valid,
    Test,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Train, Mode::Valid, Mode::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Valid => "valid",
            Mode::Test => "test",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "train" => Some(Mode::Train),
            "valid" => Some(Mode::Valid),
            "test" => Some(Mode::Test),
            _ => None,
        }
    }

    pub(crate) fn code(&self) -> u8 {
        match self {
            Mode::Train => 0,
            Mode::Valid => 1,
            Mode::Test => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Mode::ALL.get(code as usize).copied()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome class encoded by a manifest label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Condition {
    /// Label 0.
    Nonrecurrence,
    /// Label 1.
    Recurrence,
}

impl Condition {
    pub const ALL: [Condition; 2] = [Condition::Recurrence, Condition::Nonrecurrence];

    pub fn from_label(label: u8) -> Option<Self> {
        match label {
            0 => Some(Condition::Nonrecurrence),
            1 => Some(Condition::Recurrence),
            _ => None,
        }
    }

    pub fn parse_label(value: &str) -> Option<Self> {
        value.trim().parse::<u8>().ok().and_then(Self::from_label)
    }

    pub fn label(&self) -> u8 {
        match self {
            Condition::Nonrecurrence => 0,
            Condition::Recurrence => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Nonrecurrence => "nonrecurrence",
            Condition::Recurrence => "recurrence",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The (subject, image filename) pair that identifies one raw image.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdentityKey {
    pub subject: String,
    pub image: String,
}

impl IdentityKey {
    pub fn new(subject: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            image: image.into(),
        }
    }

    /// SHA-256 over the subject and image, separated by a NUL byte so that
    /// `("a", "bc")` and `("ab", "c")` never collide.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.subject.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.image.as_bytes());
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        digest
    }

    pub fn digest_hex(&self) -> String {
        self.digest().iter().map(|byte| format!("{byte:02x}")).collect()
    }

    /// RNG seed for the patch sampler.
    pub fn seed(&self) -> u64 {
        let digest = self.digest();
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(seed)
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject, self.image)
    }
}

/// One manifest row. Immutable once read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    /// 1-based line number in the manifest, for error messages only.
    pub row: u64,
    pub mode: Mode,
    pub subject: String,
    pub image: String,
    pub condition: Condition,
    pub source: String,
}

impl ImageRecord {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(self.subject.clone(), self.image.clone())
    }

    pub fn label(&self) -> u8 {
        self.condition.label()
    }

    /// The image filename without directories or extension, used to locate the
    /// mask and the detection table.
    pub fn stem(&self) -> &str {
        Path::new(&self.image)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&self.image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_and_label_domains_are_closed() {
        assert_eq!(Mode::parse(" Valid "), Some(Mode::Valid));
        assert_eq!(Mode::parse("validation"), None);
        assert_eq!(Condition::parse_label("1"), Some(Condition::Recurrence));
        assert_eq!(Condition::parse_label("0"), Some(Condition::Nonrecurrence));
        assert_eq!(Condition::parse_label("2"), None);
        assert_eq!(Condition::parse_label("yes"), None);
        for mode in Mode::ALL {
            assert_eq!(Mode::from_code(mode.code()), Some(mode));
        }
    }

    #[test]
    fn identity_digest_is_stable_and_separated() {
        let key = IdentityKey::new("00-00", "00_00_00.tif");
        assert_eq!(key.digest(), IdentityKey::new("00-00", "00_00_00.tif").digest());
        assert_eq!(key.digest_hex().len(), 64);
        assert_ne!(
            IdentityKey::new("a", "bc").digest(),
            IdentityKey::new("ab", "c").digest()
        );
    }

    #[test]
    fn stem_strips_directories_and_extension() {
        let record = ImageRecord {
            row: 2,
            mode: Mode::Train,
            subject: "00-00".to_string(),
            image: "slides/00_00_00.tif".to_string(),
            condition: Condition::Nonrecurrence,
            source: "CUMC".to_string(),
        };
        assert_eq!(record.stem(), "00_00_00");
        assert_eq!(record.identity_key().to_string(), "00-00/slides/00_00_00.tif");
    }
}
