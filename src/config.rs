//! TOML configuration for tools that open an index.
//!
//! ```toml
//! [pager]
//! page_size = 8192
//! cache_pages = 512
//! synchronous = "full"
//!
//! [index]
//! dimensions = 128
//! m = 16
//! metric = "cosine"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hnsw::{IndexOptions, Metric, Quantization};
use crate::primitives::pager::{PagerOptions, Synchronous};
use crate::types::HnswError;

/// Configuration loaded from a file, or defaults when none exists.
#[derive(Debug, Default)]
pub struct HnswConfig {
    path: Option<PathBuf>,
    data: RawConfig,
}

impl HnswConfig {
    /// Loads `explicit`, falling back to the per-user default path. A file
    /// that does not exist yields the defaults.
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let data = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => RawConfig::default(),
        };
        Ok(Self { path, data })
    }

    /// Parses configuration text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let data = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        Ok(Self { path: None, data })
    }

    /// File the configuration came from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Pager options with the `[pager]` overrides applied.
    pub fn pager_options(&self) -> Result<PagerOptions, ConfigError> {
        let raw = &self.data.pager;
        let mut options = PagerOptions::default();
        if let Some(page_size) = raw.page_size {
            options.page_size = page_size;
        }
        if let Some(cache_pages) = raw.cache_pages {
            options.cache_pages = cache_pages;
        }
        if raw.max_pages.is_some() {
            options.max_pages = raw.max_pages;
        }
        if let Some(value) = raw.synchronous.as_deref() {
            options.synchronous =
                Synchronous::from_str(value).ok_or_else(|| ConfigError::InvalidValue {
                    key: "pager.synchronous",
                    value: value.to_string(),
                })?;
        }
        if let Some(verify) = raw.verify_checksums {
            options.verify_checksums = verify;
        }
        if let Some(frames) = raw.autocheckpoint_frames {
            options.autocheckpoint_frames = frames;
        }
        options.validate().map_err(|source| ConfigError::Options {
            section: "pager",
            source,
        })?;
        Ok(options)
    }

    /// Index options with the `[index]` overrides applied.
    pub fn index_options(&self) -> Result<IndexOptions, ConfigError> {
        let raw = &self.data.index;
        let mut options = IndexOptions::default();
        if raw.dimensions.is_some() {
            options.dimensions = raw.dimensions;
        }
        if let Some(m) = raw.m {
            options.m = m;
        }
        if let Some(ef) = raw.ef_construction {
            options.ef_construction = ef;
        }
        if let Some(ef) = raw.ef_search {
            options.ef_search = ef;
        }
        if let Some(value) = raw.metric.as_deref() {
            options.metric = Metric::from_str(value).map_err(|_| ConfigError::InvalidValue {
                key: "index.metric",
                value: value.to_string(),
            })?;
        }
        if let Some(subvectors) = raw.pq_subvectors.filter(|&s| s > 0) {
            options.quantization = Quantization::Product { subvectors };
        }
        if raw.memory_budget_bytes.is_some() {
            options.memory_budget_bytes = raw.memory_budget_bytes;
        }
        options.validate().map_err(|source| ConfigError::Options {
            section: "index",
            source,
        })?;
        Ok(options)
    }

    /// Log filter from `[logging]`, if set.
    pub fn log_level(&self) -> Option<&str> {
        self.data.logging.level.as_deref()
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    pager: PagerSection,
    #[serde(default)]
    index: IndexSection,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct PagerSection {
    page_size: Option<u32>,
    cache_pages: Option<usize>,
    max_pages: Option<u32>,
    synchronous: Option<String>,
    verify_checksums: Option<bool>,
    autocheckpoint_frames: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct IndexSection {
    dimensions: Option<u32>,
    m: Option<u16>,
    ef_construction: Option<u16>,
    ef_search: Option<u16>,
    metric: Option<String>,
    pq_subvectors: Option<u16>,
    memory_budget_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct LoggingSection {
    level: Option<String>,
}

/// Failures loading or applying a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
    /// A string setting has an unknown value.
    #[error("config value '{value}' is invalid for {key}")]
    InvalidValue {
        /// Dotted key.
        key: &'static str,
        /// Rejected value.
        value: String,
    },
    /// The resulting options failed validation.
    #[error("invalid [{section}] options: {source}")]
    Options {
        /// Section name.
        section: &'static str,
        /// Validation error.
        source: HnswError,
    },
}

/// Per-user default location of the configuration file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("paged-hnsw").join("config.toml"))
}
