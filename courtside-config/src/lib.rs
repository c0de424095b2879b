//! Configuration loading for courtside.
//!
//! Resolves the collector configuration and the inventory catalog from
//! explicit paths, `COURTSIDE_*` environment variables (after `.env`) and
//! default file locations, and records which source won.

#![allow(missing_docs)]

pub mod error;
pub mod loader;

pub use error::{ConfigLoadError, Result};
pub use loader::{
    CATALOG_PATH_VAR, CONFIG_JSON_VAR, CONFIG_PATH_VAR, ConfigLoad, ConfigLoader,
    ConfigSource, DATA_ROOT_VAR, parse_file,
};
