// THEORY:
// This file is the entry point of the `recurrence_prep` library crate. It
// exposes `PrepPipeline` and its configuration as the high-level interface: a
// manifest and a directory of slides go in, six condition binary files and an
// error report come out, and later a predictions file goes in and per-subject
// votes come out.
//
// The building blocks (`core_modules`) stay public so that the binary formats can
// be read back, and single stages can be driven on their own, by tools and tests.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use config::PrepConfig;
pub use core_modules::artifact::BinaryArtifact;
pub use core_modules::partitioner::{Bucket, read_condition_file};
pub use core_modules::record::{Condition, IdentityKey, ImageRecord, Mode};
pub use core_modules::vote::{Decision, VoteRecord};
pub use error::{ErrorKind, PipelineError};
pub use pipeline::{PrepPipeline, RunReport, VoteReport};
