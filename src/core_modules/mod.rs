pub mod artifact;
pub mod artifact_cache;
pub mod builder;
pub(crate) mod codec;
pub mod detections;
pub mod error_sink;
pub mod manifest;
pub mod partitioner;
pub mod raw_inputs;
pub mod record;
pub mod sampler;
pub mod tile_grid;
pub mod vote;
