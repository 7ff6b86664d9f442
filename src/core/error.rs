//! Error types for the reconstruction pipeline

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the pipeline
///
/// Workers never catch these; the first error raised on any worker thread is
/// stored by its group and rethrown to the driver after the join.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input data (bad header, missing property)
    #[error("format error: {0}")]
    Format(String),

    /// Too many splats cover a single grid cell, so no subdivision can
    /// satisfy the bucket splat limit
    #[error("too many splats covering one cell ({cell_splats})")]
    Density { cell_splats: u64 },

    /// File read/write failure, captured with the file name
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A device cannot fit the buffers the configuration requires
    #[error("resource error: {0}")]
    Resource(String),

    /// API misuse (empty stream, bad iterator state)
    #[error("state error: {0}")]
    State(&'static str),

    /// Integer overflow in a size computation
    #[error("range error: {0}")]
    Range(&'static str),
}

impl Error {
    /// Attach a file name to an I/O failure.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
