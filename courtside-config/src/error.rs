use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {origin}: {message}")]
    Parse { origin: String, message: String },

    #[error("invalid configuration from {origin}: {message}")]
    Invalid { origin: String, message: String },

    #[error(
        "no catalog found; pass --catalog or set COURTSIDE_CATALOG_PATH"
    )]
    CatalogNotFound,

    #[error("catalog {path} defines no valid data types")]
    EmptyCatalog { path: PathBuf },
}

pub type Result<T> = std::result::Result<T, ConfigLoadError>;
