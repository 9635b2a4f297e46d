use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::PipelineBuildError;

/// No se pudo persistir el ledger o las tablas de salida.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode ledger entry: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("cannot write table {path}: {source}")]
    Table {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn table(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        StorageError::Table {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("worker pool closed with {0} task(s) still pending")]
    Closed(usize),
}

/// Errores que abortan la corrida completa.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Build(#[from] PipelineBuildError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("aborting after {count} consecutive storage failures; last: {last}")]
    TooManyStorageFailures { count: u32, last: StorageError },
    #[error(transparent)]
    Pool(#[from] PoolError),
}
