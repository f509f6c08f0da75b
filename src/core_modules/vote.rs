// THEORY:
// The model scores images; clinicians need a call per patient. The
// `VoteAggregator` closes that gap by reducing every subject's per-image
// predictions to one score and one decision, and by making silence explicit:
// a test subject the model never scored gets a `NoData` vote instead of
// disappearing from the report.
//
// Key principles:
// 1.  **Order-free reduction**: a subject's scores are sorted before they are
//     summed, so the floating-point result does not depend on the order in which
//     predictions arrive.
// 2.  **Strict threshold**: recurrence requires a score strictly above the
//     threshold. A score exactly on it is nonrecurrence.
// 3.  **Total coverage of the test set**: every manifest test subject appears in
//     the output exactly once.

use crate::config::PrepConfig;
use crate::core_modules::record::{Condition, ImageRecord, Mode};
use crate::error::VoteError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// One model output for one image.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRecord {
    pub subject: String,
    pub image: String,
    /// Predicted probability of recurrence, or a hard 0/1 class label.
    pub score: f64,
}

/// How a subject's per-image scores become one score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteReducer {
    /// Mean of the image scores.
    #[default]
    Mean,
    /// Fraction of images whose score exceeds the threshold.
    Majority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    Recurrence,
    Nonrecurrence,
    NoData,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Recurrence => "recurrence",
            Decision::Nonrecurrence => "nonrecurrence",
            Decision::NoData => "no_data",
        }
    }

    pub fn condition(&self) -> Option<Condition> {
        match self {
            Decision::Recurrence => Some(Condition::Recurrence),
            Decision::Nonrecurrence => Some(Condition::Nonrecurrence),
            Decision::NoData => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The verdict for one subject.
#[derive(Debug, Clone, PartialEq)]
pub struct VoteRecord {
    pub subject: String,
    /// `None` only for `NoData`.
    pub score: Option<f64>,
    pub decision: Decision,
    pub ground_truth: Option<Condition>,
    /// Number of predictions that contributed.
    pub images: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VoteSummary {
    pub subjects: usize,
    pub decided: usize,
    pub no_data: usize,
    /// Decided subjects with a known ground truth.
    pub evaluated: usize,
    pub correct: usize,
}

impl VoteSummary {
    pub fn accuracy(&self) -> Option<f64> {
        (self.evaluated > 0).then(|| self.correct as f64 / self.evaluated as f64)
    }
}

#[derive(Debug, Clone)]
pub struct VoteAggregator {
    threshold: f64,
    reducer: VoteReducer,
}

impl VoteAggregator {
    pub fn new(threshold: f64, reducer: VoteReducer) -> Self {
        Self { threshold, reducer }
    }

    pub fn from_config(config: &PrepConfig) -> Self {
        Self::new(config.threshold, config.reducer)
    }

    pub fn decide(&self, score: f64) -> Decision {
        if score > self.threshold {
            Decision::Recurrence
        } else {
            Decision::Nonrecurrence
        }
    }

    fn reduce(&self, scores: &mut [f64]) -> f64 {
        scores.sort_by(f64::total_cmp);
        match self.reducer {
            VoteReducer::Mean => scores.iter().sum::<f64>() / scores.len() as f64,
            VoteReducer::Majority => {
                let above = scores.iter().filter(|&&score| score > self.threshold).count();
                above as f64 / scores.len() as f64
            }
        }
    }

    /// One vote per predicted subject plus a `NoData` vote for every unscored
    /// test subject of the manifest, sorted by subject.
    pub fn aggregate(
        &self,
        predictions: &[PredictionRecord],
        records: &[ImageRecord],
    ) -> Vec<VoteRecord> {
        let truth = ground_truth(records);

        let mut scores: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
        for prediction in predictions {
            scores
                .entry(prediction.subject.as_str())
                .or_default()
                .push(prediction.score);
        }

        let mut votes: Vec<VoteRecord> = scores
            .into_iter()
            .map(|(subject, mut subject_scores)| {
                let score = self.reduce(&mut subject_scores);
                VoteRecord {
                    subject: subject.to_string(),
                    score: Some(score),
                    decision: self.decide(score),
                    ground_truth: truth.get(subject).copied().flatten(),
                    images: subject_scores.len(),
                }
            })
            .collect();

        let scored: Vec<String> = votes.iter().map(|vote| vote.subject.clone()).collect();
        for (subject, condition) in &truth {
            if scored.binary_search_by(|s| s.as_str().cmp(*subject)).is_err() {
                votes.push(VoteRecord {
                    subject: subject.to_string(),
                    score: None,
                    decision: Decision::NoData,
                    ground_truth: *condition,
                    images: 0,
                });
            }
        }
        votes.sort_by(|a, b| a.subject.cmp(&b.subject));
        votes
    }
}

/// Ground truth per test subject. Subjects whose test rows disagree map to `None`.
fn ground_truth(records: &[ImageRecord]) -> BTreeMap<&str, Option<Condition>> {
    let mut truth: BTreeMap<&str, Option<Condition>> = BTreeMap::new();
    for record in records.iter().filter(|record| record.mode == Mode::Test) {
        match truth.get(record.subject.as_str()).copied() {
            None => {
                truth.insert(record.subject.as_str(), Some(record.condition));
            }
            Some(Some(known)) if known != record.condition => {
                warn!(
                    "Test subject {} has conflicting labels; no ground truth",
                    record.subject
                );
                truth.insert(record.subject.as_str(), None);
            }
            Some(_) => {}
        }
    }
    truth
}

pub fn summarize(votes: &[VoteRecord]) -> VoteSummary {
    let mut summary = VoteSummary {
        subjects: votes.len(),
        ..VoteSummary::default()
    };
    for vote in votes {
        let Some(decided) = vote.decision.condition() else {
            summary.no_data += 1;
            continue;
        };
        summary.decided += 1;
        if let Some(truth) = vote.ground_truth {
            summary.evaluated += 1;
            summary.correct += (truth == decided) as usize;
        }
    }
    summary
}

/// Reads a predictions CSV with columns `subject`, `image` and `score`.
pub fn read_predictions(path: impl AsRef<Path>) -> Result<Vec<PredictionRecord>, VoteError> {
    let path = path.as_ref();
    let csv_error = |source: csv::Error| VoteError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(csv_error)?;
    let headers = reader.headers().map_err(csv_error)?.clone();
    let column = |name: &'static str| {
        headers
            .iter()
            .position(|header| header.eq_ignore_ascii_case(name))
            .ok_or(VoteError::MissingColumn {
                path: path.to_path_buf(),
                column: name,
            })
    };
    let subject_col = column("subject")?;
    let image_col = column("image")?;
    let score_col = column("score")?;

    let mut predictions = Vec::new();
    for (index, result) in reader.records().enumerate() {
        let row = result.map_err(csv_error)?;
        let line = row
            .position()
            .map(|position| position.line())
            .unwrap_or(index as u64 + 2);
        let field = |col: usize| row.get(col).unwrap_or("");

        let raw = field(score_col);
        let score = raw
            .parse::<f64>()
            .ok()
            .filter(|score| score.is_finite() && (0.0..=1.0).contains(score))
            .ok_or_else(|| VoteError::InvalidScore {
                row: line,
                value: raw.to_string(),
            })?;

        predictions.push(PredictionRecord {
            subject: field(subject_col).to_string(),
            image: field(image_col).to_string(),
            score,
        });
    }

    info!("Loaded {} predictions from {}", predictions.len(), path.display());
    Ok(predictions)
}

#[derive(Serialize)]
struct VoteRow<'a> {
    subject: &'a str,
    score: Option<f64>,
    decision: &'static str,
    ground_truth: Option<u8>,
    images: usize,
}

/// Writes the voting report: subject, score, decision, ground_truth, images.
pub fn write_vote_report(path: impl AsRef<Path>, votes: &[VoteRecord]) -> Result<(), VoteError> {
    let path = path.as_ref();
    let csv_error = |source: csv::Error| VoteError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .map_err(csv_error)?;
    writer
        .write_record(["subject", "score", "decision", "ground_truth", "images"])
        .map_err(csv_error)?;
    for vote in votes {
        writer
            .serialize(VoteRow {
                subject: &vote.subject,
                score: vote.score,
                decision: vote.decision.as_str(),
                ground_truth: vote.ground_truth.map(|condition| condition.label()),
                images: vote.images,
            })
            .map_err(csv_error)?;
    }
    writer.flush().map_err(|source| csv_error(source.into()))?;
    Ok(())
}
