// THEORY:
// The `pipeline` module is the top-level API of the crate. `PrepPipeline` owns a
// validated configuration and exposes the two batch operations a study needs:
// `run` turns a manifest into the six condition binary files plus an error
// report, and `vote` turns a model's per-image predictions into per-subject
// decisions.
//
// A preparation run has four stages:
// 1.  **Read**: the manifest is parsed in full. Any manifest error aborts here,
//     before any work is scheduled.
// 2.  **Build**: every record whose mode is enabled is submitted to the
//     `WorkerPool`, which serves artifacts from the `ArtifactCache` and routes
//     each outcome to the `Partitioner` or the `ErrorSink`.
// 3.  **Write**: all six buckets are written, empty ones included. A bucket that
//     fails to write is reported and the others still complete.
// 4.  **Report**: the error sink is drained into the error report CSV.

use crate::config::{PatchConfig, PrepConfig};
use crate::core_modules::artifact_cache::{ArtifactCache, CacheStats};
use crate::core_modules::builder::ArtifactBuilder;
use crate::core_modules::error_sink::{self, ErrorRecord, ErrorSink};
use crate::core_modules::manifest::read_manifest;
use crate::core_modules::partitioner::{BucketReport, Partitioner};
use crate::core_modules::record::{IdentityKey, ImageRecord};
use crate::core_modules::vote::{self, VoteAggregator, VoteRecord, VoteSummary};
use crate::error::{ConfigError, PipelineError};
use crate::parallel_pipeline::{BuildStatus, PoolContext, WorkerPool};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything a completed preparation run produced.
#[derive(Debug)]
pub struct RunReport {
    /// Rows in the manifest.
    pub records: usize,
    pub built: usize,
    pub failed: usize,
    /// Rows whose mode is not enabled in the configuration.
    pub skipped: usize,
    pub cache: CacheStats,
    pub buckets: Vec<BucketReport>,
    pub errors: Vec<ErrorRecord>,
    pub error_report: PathBuf,
}

impl RunReport {
    pub fn all_buckets_written(&self) -> bool {
        self.buckets.iter().all(BucketReport::is_written)
    }
}

/// Everything a completed voting run produced.
#[derive(Debug)]
pub struct VoteReport {
    pub votes: Vec<VoteRecord>,
    pub summary: VoteSummary,
    pub report: PathBuf,
}

pub struct PrepPipeline {
    config: Arc<PrepConfig>,
}

/// Identity keys that appear under sources with different patch profiles. The
/// cache is keyed by identity alone, so those rows share one artifact.
pub fn profile_conflicts<'a>(
    records: impl IntoIterator<Item = &'a ImageRecord>,
    config: &PrepConfig,
) -> Vec<IdentityKey> {
    let mut profiles: HashMap<IdentityKey, &PatchConfig> = HashMap::new();
    let mut conflicts = Vec::new();
    for record in records {
        let key = record.identity_key();
        let profile = config.patch_for_source(&record.source);
        match profiles.get(&key) {
            None => {
                profiles.insert(key, profile);
            }
            Some(&first) if first != profile && !conflicts.contains(&key) => conflicts.push(key),
            Some(_) => {}
        }
    }
    conflicts
}

impl PrepPipeline {
    pub fn new(config: PrepConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &PrepConfig {
        &self.config
    }

    pub async fn run(&self, manifest: impl AsRef<Path>) -> Result<RunReport, PipelineError> {
        // --- 1. Read ---
        let records = read_manifest(manifest)?;
        for dir in [&self.config.cache_dir, &self.config.output_dir] {
            fs::create_dir_all(dir).map_err(|source| PipelineError::Io {
                path: dir.clone(),
                source,
            })?;
        }

        let enabled = records.iter().filter(|record| self.config.processes(record.mode));
        for key in profile_conflicts(enabled, &self.config) {
            warn!(
                "{} is listed under sources with different patch profiles; \
                 every row gets the artifact built first",
                key
            );
        }

        // --- 2. Build ---
        let cache = Arc::new(ArtifactCache::new(
            &self.config.cache_dir,
            ArtifactBuilder::new(self.config.clone()),
        ));
        let sink = Arc::new(ErrorSink::new());
        let partitioner = Arc::new(Partitioner::new());
        let pool = WorkerPool::new(
            self.config.worker_count(),
            PoolContext {
                cache: cache.clone(),
                sink: sink.clone(),
                partitioner: partitioner.clone(),
            },
        );

        let mut pending = Vec::with_capacity(records.len());
        let mut skipped = 0usize;
        for (index, record) in records.iter().enumerate() {
            if !self.config.processes(record.mode) {
                skipped += 1;
                continue;
            }
            let receiver = pool
                .submit(index, record.clone())
                .map_err(|_| PipelineError::WorkerPool)?;
            pending.push(receiver);
        }

        let mut built = 0usize;
        let mut failed = 0usize;
        for status in futures::future::join_all(pending).await {
            match status.map_err(|_| PipelineError::WorkerPool)? {
                BuildStatus::Built => built += 1,
                BuildStatus::Failed(_) => failed += 1,
            }
        }
        pool.shutdown().await;

        // --- 3. Write ---
        let buckets = partitioner.write_all(&self.config.output_dir);

        // --- 4. Report ---
        let errors = sink.drain();
        let error_report = self.config.error_report_path();
        if let Some(parent) = error_report.parent() {
            fs::create_dir_all(parent).map_err(|source| PipelineError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        error_sink::write_report(&error_report, &errors).map_err(|source| {
            PipelineError::ErrorReport {
                path: error_report.clone(),
                source,
            }
        })?;

        let cache_stats = cache.stats();
        info!(
            "Prepared {} of {} records ({} failed, {} skipped; {} cache hits, {} builds)",
            built,
            records.len(),
            failed,
            skipped,
            cache_stats.hits,
            cache_stats.builds
        );
        for bucket in buckets.iter().filter(|bucket| !bucket.is_written()) {
            warn!("Condition file {} was not written", bucket.path.display());
        }
        if !errors.is_empty() {
            warn!("{} records failed; see {}", errors.len(), error_report.display());
        }

        Ok(RunReport {
            records: records.len(),
            built,
            failed,
            skipped,
            cache: cache_stats,
            buckets,
            errors,
            error_report,
        })
    }

    /// Aggregates per-image predictions into per-subject votes and writes the voting report.
    pub fn vote(
        &self,
        manifest: impl AsRef<Path>,
        predictions: impl AsRef<Path>,
    ) -> Result<VoteReport, PipelineError> {
        let records = read_manifest(manifest)?;
        let predictions = vote::read_predictions(predictions)?;

        let votes = VoteAggregator::from_config(&self.config).aggregate(&predictions, &records);
        let summary = vote::summarize(&votes);

        let report = self.config.vote_report_path();
        if let Some(parent) = report.parent() {
            fs::create_dir_all(parent).map_err(|source| PipelineError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        vote::write_vote_report(&report, &votes)?;

        match summary.accuracy() {
            Some(accuracy) => info!(
                "Voted {} subjects ({} no data): {}/{} correct ({:.1}%)",
                summary.subjects,
                summary.no_data,
                summary.correct,
                summary.evaluated,
                accuracy * 100.0
            ),
            None => info!(
                "Voted {} subjects ({} no data), none with ground truth",
                summary.subjects, summary.no_data
            ),
        }

        Ok(VoteReport {
            votes,
            summary,
            report,
        })
    }
}
