// THEORY:
// The manifest is the only fatal input of a run. It is read in full before any
// work is scheduled, so a bad column or an out-of-domain value aborts the run
// before a single artifact is built. Row order is preserved exactly; it becomes
// the ordering of every condition binary file.

use crate::core_modules::record::{Condition, ImageRecord, Mode};
use crate::error::ManifestError;
use std::path::Path;
use tracing::info;

pub const REQUIRED_COLUMNS: [&str; 5] = ["mode", "subject", "image", "label", "source"];

/// Reads the manifest at `path` into records, preserving row order.
/// Duplicate identity keys are kept; each row is its own work item.
pub fn read_manifest(path: impl AsRef<Path>) -> Result<Vec<ImageRecord>, ManifestError> {
    let path = path.as_ref();
    let csv_error = |source: csv::Error| ManifestError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let file = std::fs::File::open(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(file);

    let headers = reader.headers().map_err(csv_error)?.clone();
    let mut columns = [0usize; REQUIRED_COLUMNS.len()];
    for (slot, column) in columns.iter_mut().zip(REQUIRED_COLUMNS) {
        *slot = headers
            .iter()
            .position(|header| header.eq_ignore_ascii_case(column))
            .ok_or(ManifestError::Format {
                path: path.to_path_buf(),
                column,
            })?;
    }
    let [mode_col, subject_col, image_col, label_col, source_col] = columns;

    let mut records = Vec::new();
    for (index, result) in reader.records().enumerate() {
        let row = result.map_err(csv_error)?;
        let line = row
            .position()
            .map(|position| position.line())
            .unwrap_or(index as u64 + 2);
        let field = |col: usize| row.get(col).unwrap_or("");

        let mode = Mode::parse(field(mode_col)).ok_or_else(|| ManifestError::Value {
            row: line,
            column: "mode",
            value: field(mode_col).to_string(),
        })?;
        let condition =
            Condition::parse_label(field(label_col)).ok_or_else(|| ManifestError::Value {
                row: line,
                column: "label",
                value: field(label_col).to_string(),
            })?;

        records.push(ImageRecord {
            row: line,
            mode,
            subject: field(subject_col).to_string(),
            image: field(image_col).to_string(),
            condition,
            source: field(source_col).to_string(),
        });
    }

    info!("Loaded {} records from manifest {}", records.len(), path.display());
    Ok(records)
}
