// THEORY:
// The `ErrorSink` is where per-record failures go instead of up the stack. Every
// worker holds a shared handle and appends as it finishes; the pipeline drains it
// once the pool is idle and writes the error report. Entries are kept in
// completion order and never merged, so two failures for the same key are two
// rows.

use crate::core_modules::record::IdentityKey;
use crate::error::{ErrorKind, RecordError};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

/// One failed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub key: IdentityKey,
    pub kind: ErrorKind,
    pub detail: String,
}

#[derive(Serialize)]
struct ReportRow<'a> {
    subject: &'a str,
    image: &'a str,
    kind: &'static str,
    detail: &'a str,
}

#[derive(Debug, Default)]
pub struct ErrorSink {
    entries: Mutex<Vec<ErrorRecord>>,
}

impl ErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: IdentityKey, kind: ErrorKind, detail: impl Into<String>) {
        let entry = ErrorRecord {
            key,
            kind,
            detail: detail.into(),
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    pub fn record_failure(&self, key: IdentityKey, error: &RecordError) {
        warn!("{} failed: {} ({})", key, error.kind(), error);
        self.record(key, error.kind(), error.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes every entry recorded so far, in completion order.
    pub fn drain(&self) -> Vec<ErrorRecord> {
        std::mem::take(&mut *self.entries.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Writes the error report CSV. The header is written even when there are no entries.
pub fn write_report(path: &Path, entries: &[ErrorRecord]) -> Result<(), csv::Error> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
    writer.write_record(["subject", "image", "kind", "detail"])?;
    for entry in entries {
        writer.serialize(ReportRow {
            subject: &entry.key.subject,
            image: &entry.key.image,
            kind: entry.kind.as_str(),
            detail: &entry.detail,
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn concurrent_appends_are_all_kept() {
        let sink = Arc::new(ErrorSink::new());
        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let sink = sink.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        sink.record(
                            IdentityKey::new(format!("{worker:02}"), format!("{i}.tif")),
                            ErrorKind::MissingFile,
                            "mask (masks/mask_x.tif)",
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(sink.len(), 100);
        assert_eq!(sink.drain().len(), 100);
        assert!(sink.is_empty());
    }

    #[test]
    fn report_has_a_header_even_when_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.csv");
        write_report(&path, &[]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "subject,image,kind,detail\n");

        let entry = ErrorRecord {
            key: IdentityKey::new("00-00", "00_00_00.tif"),
            kind: ErrorKind::Parse,
            detail: "detections could not be parsed: table has no cell rows".to_string(),
        };
        write_report(&path, &[entry]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text.lines().nth(1),
            Some(concat!(
                "00-00,00_00_00.tif,ParseError,",
                "detections could not be parsed: table has no cell rows"
            ))
        );
    }
}
