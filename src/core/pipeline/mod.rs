// src/core/pipeline/mod.rs

//! The shard pipeline: segmentation, distribution, processing, retrieval and
//! concatenation of video shards.
//!
//! `master` holds the side run by the current leader, `worker` the side every
//! other node serves, and `job` the per-video bookkeeping.

pub mod job;
pub mod master;
pub mod worker;
