//! Core types and cross-cutting utilities

pub mod chunk;
pub mod error;
pub mod logging;
pub mod progress;
pub mod stats;
pub mod types;

pub use chunk::ChunkId;
pub use error::Error;
pub use types::*;
