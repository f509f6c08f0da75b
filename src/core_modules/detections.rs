// THEORY:
// The detection table is the per-cell export of the cell detector: one tab
// separated row per nucleus with its centroid and a set of morphology
// measurements. Exports in the wild contain truncated lines, `NaN` cells and
// stray annotation rows, so parsing is tolerant row by row and strict only at
// the table level.
//
// Key principles:
// 1.  **Row tolerance**: a row missing a required field, or holding a value that
//     is not a finite number, is skipped and counted.
// 2.  **Table threshold**: the table is accepted only if a strict majority of its
//     data rows parse. A table that is mostly garbage is a `ParseError`, not a
//     silently thin artifact.
// 3.  **Pixel space**: centroids are converted to image pixels on load, so every
//     downstream module works in one coordinate system.

use crate::config::DetectionConfig;
use crate::error::{InputKind, RecordError};
use std::path::Path;
use tracing::debug;

/// One well-formed detection row.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    /// Centroid column in image pixels.
    pub x: f64,
    /// Centroid row in image pixels.
    pub y: f64,
    /// Values of the configured feature columns, in configuration order.
    pub features: Vec<f32>,
}

/// The parsed cells of one table plus the row accounting used by the artifact header.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionTable {
    pub cells: Vec<Cell>,
    pub rows_parsed: u32,
    pub rows_skipped: u32,
}

impl DetectionTable {
    pub fn read(path: &Path, config: &DetectionConfig) -> Result<Self, RecordError> {
        let parse_error = |detail: String| RecordError::Parse {
            input: InputKind::Detections,
            detail,
        };

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|err| parse_error(err.to_string()))?;

        let headers = reader
            .headers()
            .map_err(|err| parse_error(err.to_string()))?
            .clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|header| header == name)
                .ok_or_else(|| parse_error(format!("missing column '{name}'")))
        };
        let x_col = column(&config.centroid_x_column)?;
        let y_col = column(&config.centroid_y_column)?;
        let feature_cols = config
            .feature_columns
            .iter()
            .map(|name| column(name))
            .collect::<Result<Vec<_>, _>>()?;

        let mut cells = Vec::new();
        let mut rows_skipped = 0u32;
        for result in reader.records() {
            let parsed = result.ok().and_then(|row| {
                let number = |col: usize| {
                    row.get(col)
                        .and_then(|value| value.parse::<f64>().ok())
                        .filter(|value| value.is_finite())
                };
                let x = number(x_col)? / config.microns_per_pixel;
                let y = number(y_col)? / config.microns_per_pixel;
                let features = feature_cols
                    .iter()
                    .map(|&col| number(col).map(|value| value as f32))
                    .collect::<Option<Vec<_>>>()?;
                Some(Cell { x, y, features })
            });
            match parsed {
                Some(cell) => cells.push(cell),
                None => rows_skipped += 1,
            }
        }

        let rows_parsed = cells.len() as u32;
        let total = rows_parsed + rows_skipped;
        if total == 0 {
            return Err(parse_error("table has no cell rows".to_string()));
        }
        if rows_parsed * 2 <= total {
            return Err(parse_error(format!(
                "only {rows_parsed} of {total} rows are well-formed"
            )));
        }
        if rows_skipped > 0 {
            debug!(
                "Skipped {} malformed rows of {} in {}",
                rows_skipped,
                total,
                path.display()
            );
        }

        Ok(Self {
            cells,
            rows_parsed,
            rows_skipped,
        })
    }

    /// Cells whose centroid lies in the half-open box `[x0, x1) × [y0, y1)`.
    pub fn cells_in(&self, x0: f64, y0: f64, x1: f64, y1: f64) -> impl Iterator<Item = &Cell> {
        self.cells
            .iter()
            .filter(move |cell| cell.x >= x0 && cell.x < x1 && cell.y >= y0 && cell.y < y1)
    }
}
