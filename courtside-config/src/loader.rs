use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use courtside_core::{CatalogFile, CatalogLoad, CollectorConfig, Catalog};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::error::{ConfigLoadError, Result};

pub const CONFIG_PATH_VAR: &str = "COURTSIDE_CONFIG_PATH";
pub const CONFIG_JSON_VAR: &str = "COURTSIDE_CONFIG_JSON";
pub const CATALOG_PATH_VAR: &str = "COURTSIDE_CATALOG_PATH";
pub const DATA_ROOT_VAR: &str = "COURTSIDE_DATA_ROOT";

const CONFIG_CANDIDATES: &[&str] = &[
    "courtside.toml",
    "courtside.json",
    "config/courtside.toml",
    "config/courtside.json",
];

const CATALOG_CANDIDATES: &[&str] = &[
    "catalog.toml",
    "catalog.json",
    "config/catalog.toml",
    "config/catalog.json",
];

/// Where the effective collector configuration came from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConfigSource {
    #[default]
    Default,
    /// Explicit path, e.g. from `--config`.
    Explicit(PathBuf),
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Default => f.write_str("built-in defaults"),
            ConfigSource::Explicit(path) => write!(f, "{}", path.display()),
            ConfigSource::EnvPath(path) => {
                write!(f, "{} (${CONFIG_PATH_VAR})", path.display())
            }
            ConfigSource::EnvInline => write!(f, "${CONFIG_JSON_VAR}"),
            ConfigSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: CollectorConfig,
    pub source: ConfigSource,
}

/// Resolves configuration and catalog files from explicit paths, the
/// environment and well-known locations under a base directory.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    base_dir: PathBuf,
    vars: HashMap<String, String>,
}

impl ConfigLoader {
    /// Loader over the process environment, after applying `.env`.
    pub fn from_env() -> Self {
        if let Err(err) = dotenvy::dotenv()
            && !err.not_found()
        {
            warn!(error = %err, "ignoring unreadable .env file");
        }
        Self {
            base_dir: PathBuf::from("."),
            vars: std::env::vars().collect(),
        }
    }

    /// Loader with an explicit environment, for tests and embedding.
    pub fn with_vars<I, K, V>(base_dir: impl Into<PathBuf>, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            base_dir: base_dir.into(),
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    fn var(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    fn find(&self, candidates: &[&str]) -> Option<PathBuf> {
        candidates
            .iter()
            .map(|candidate| self.base_dir.join(candidate))
            .find(|path| path.is_file())
    }

    /// Evaluation order: `explicit`, `$COURTSIDE_CONFIG_PATH`,
    /// `$COURTSIDE_CONFIG_JSON`, default files, built-in defaults.
    /// `$COURTSIDE_DATA_ROOT` overrides the storage root afterwards.
    pub fn load_config(&self, explicit: Option<&Path>) -> Result<ConfigLoad> {
        let (mut config, source) = if let Some(path) = explicit {
            let path = self.resolve(path);
            (parse_file(&path)?, ConfigSource::Explicit(path))
        } else if let Some(raw) = self.var(CONFIG_PATH_VAR) {
            let path = self.resolve(Path::new(raw));
            (parse_file(&path)?, ConfigSource::EnvPath(path))
        } else if let Some(raw) = self.var(CONFIG_JSON_VAR) {
            let config = serde_json::from_str(raw).map_err(|err| {
                ConfigLoadError::Parse {
                    origin: format!("${CONFIG_JSON_VAR}"),
                    message: err.to_string(),
                }
            })?;
            (config, ConfigSource::EnvInline)
        } else if let Some(path) = self.find(CONFIG_CANDIDATES) {
            (parse_file(&path)?, ConfigSource::File(path))
        } else {
            (CollectorConfig::default(), ConfigSource::Default)
        };

        if let Some(root) = self.var(DATA_ROOT_VAR) {
            config.storage.data_root = PathBuf::from(root);
        }
        config
            .validate()
            .map_err(|message| ConfigLoadError::Invalid {
                origin: source.to_string(),
                message,
            })?;

        info!(source = %source, "collector configuration loaded");
        Ok(ConfigLoad { config, source })
    }

    /// Evaluation order: `explicit`, `$COURTSIDE_CATALOG_PATH`, default
    /// files.
    pub fn catalog_path(&self, explicit: Option<&Path>) -> Result<PathBuf> {
        explicit
            .map(|path| self.resolve(path))
            .or_else(|| {
                self.var(CATALOG_PATH_VAR)
                    .map(|raw| self.resolve(Path::new(raw)))
            })
            .or_else(|| self.find(CATALOG_CANDIDATES))
            .ok_or(ConfigLoadError::CatalogNotFound)
    }

    /// Reads and validates the catalog. Individual bad entries are rejected
    /// and reported; a catalog with nothing valid left is an error.
    pub fn load_catalog(&self, explicit: Option<&Path>) -> Result<(PathBuf, CatalogLoad)> {
        let path = self.catalog_path(explicit)?;
        let file: CatalogFile = parse_file(&path)?;
        let load = Catalog::from_file(file, Utc::now());
        if load.catalog.is_empty() {
            return Err(ConfigLoadError::EmptyCatalog { path });
        }
        info!(
            path = %path.display(),
            data_types = load.catalog.len(),
            rejected = load.rejected.len(),
            "catalog loaded"
        );
        Ok((path, load))
    }
}

/// Parses TOML or JSON by extension, trying both for unknown extensions.
pub fn parse_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let origin = path.display().to_string();
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => parse_json(&contents, &origin),
        Some("toml") => parse_toml(&contents, &origin),
        _ => parse_toml(&contents, &origin).or_else(|toml_err| {
            parse_json(&contents, &origin).map_err(|json_err| ConfigLoadError::Parse {
                origin: origin.clone(),
                message: format!("toml error: {toml_err}; json error: {json_err}"),
            })
        }),
    }
}

fn parse_toml<T: DeserializeOwned>(contents: &str, origin: &str) -> Result<T> {
    toml::from_str(contents).map_err(|err| ConfigLoadError::Parse {
        origin: origin.to_string(),
        message: err.to_string(),
    })
}

fn parse_json<T: DeserializeOwned>(contents: &str, origin: &str) -> Result<T> {
    serde_json::from_str(contents).map_err(|err| ConfigLoadError::Parse {
        origin: origin.to_string(),
        message: err.to_string(),
    })
}
