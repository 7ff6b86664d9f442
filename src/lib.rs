//! splatstream - out-of-core surface reconstruction core
//!
//! Turns very large point clouds of oriented splats into the inputs of a
//! GPU surface extractor: hierarchical bucketing of splats under strict
//! memory budgets, a differentially-coded on-disk blob index, and a
//! multi-stage worker pipeline feeding multiple devices with back-pressure.

pub mod bucket;
pub mod core;
pub mod math;
pub mod pipeline;
pub mod splat;
pub mod tree;
