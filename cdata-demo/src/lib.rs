//! Demonstration consumer for exported Int32 array records

use std::io::Write;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use cdata_core::{ArrayAccess, DataType, FFI_ArrowArray, ImportedArray};

/// Environment variable naming an optional JSON config file
pub const CONFIG_PATH_ENV: &str = "CDATA_DEMO_CONFIG";
/// Environment override for [`DemoConfig::preview_len`]
pub const PREVIEW_ENV: &str = "CDATA_DEMO_PREVIEW";
/// Environment override for [`DemoConfig::length`]
pub const LENGTH_ENV: &str = "CDATA_DEMO_LENGTH";
/// Environment override for [`DemoConfig::seed`]
pub const SEED_ENV: &str = "CDATA_DEMO_SEED";

/// Errors the demo can report
#[derive(Error, Debug)]
pub enum DemoError {
    /// Reading the config file failed
    #[error("failed to read config {path}: {source}")]
    ConfigIo {
        /// Path that was read
        path: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`DemoConfig`]
    #[error("invalid config {path}: {source}")]
    ConfigParse {
        /// Path that was parsed
        path: String,
        /// Underlying parse error
        source: serde_json::Error,
    },

    /// An environment override could not be parsed
    #[error("invalid value {value:?} for {name}")]
    InvalidOverride {
        /// Variable name
        name: &'static str,
        /// Value found
        value: String,
    },

    /// The exporter did not populate the record
    #[error("exporter returned status {0}")]
    Export(i32),

    /// Reading or releasing the record failed
    #[error(transparent)]
    Record(#[from] cdata_core::Error),

    /// Writing the preview failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for the demo
pub type Result<T> = std::result::Result<T, DemoError>;

/// Demo settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Number of leading elements to print
    pub preview_len: usize,

    /// Number of elements to export
    pub length: usize,

    /// Seed for the exported values; random when unset
    pub seed: Option<u64>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            preview_len: 10,
            length: 1000,
            seed: None,
        }
    }
}

impl DemoConfig {
    /// Parse a JSON config file; missing fields keep their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DemoError::ConfigIo {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| DemoError::ConfigParse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Defaults, then the file named by `CDATA_DEMO_CONFIG`, then the
    /// individual variable overrides
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`DemoConfig::from_env`] with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(value) = lookup(PREVIEW_ENV) {
            config.preview_len = parse_override(PREVIEW_ENV, value)?;
        }
        if let Some(value) = lookup(LENGTH_ENV) {
            config.length = parse_override(LENGTH_ENV, value)?;
        }
        if let Some(value) = lookup(SEED_ENV) {
            config.seed = Some(parse_override(SEED_ENV, value)?);
        }

        Ok(config)
    }
}

fn parse_override<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DemoError::InvalidOverride { name, value })
}

/// Lines `data[i] = v` for the first `limit` elements
///
/// A record without a data buffer has nothing to show and yields no lines.
/// Null elements print as `null`.
pub fn render_preview<A: ArrayAccess>(array: &A, limit: usize) -> Result<Vec<String>> {
    if array.get_buffer(1)?.is_none() {
        tracing::debug!("record has no data buffer; nothing to preview");
        return Ok(Vec::new());
    }

    (0..limit.min(array.len()))
        .map(|i| {
            Ok(match array.value::<i32>(i)? {
                Some(v) => format!("data[{i}] = {v}"),
                None => format!("data[{i}] = null"),
            })
        })
        .collect()
}

/// Export a record through the C entry point, print its preview to `out`,
/// and release it
#[allow(unsafe_code)]
pub fn run<W: Write>(config: &DemoConfig, out: &mut W) -> Result<()> {
    let mut raw = FFI_ArrowArray::empty();
    let length = i64::try_from(config.length).map_err(|_| DemoError::InvalidOverride {
        name: LENGTH_ENV,
        value: config.length.to_string(),
    })?;

    // Safety: `raw` is a live local the exporter may overwrite
    let status = unsafe {
        match config.seed {
            Some(seed) => arrow_exporter::export_int32_data_with(&mut raw, length, seed),
            None if config.length == arrow_exporter::DEFAULT_LENGTH => {
                arrow_exporter::export_int32_data(&mut raw);
                0
            }
            None => {
                arrow_exporter::export_int32_data_with(&mut raw, length, cdata_core::random_seed())
            }
        }
    };
    if status != 0 || raw.is_released() {
        return Err(DemoError::Export(status));
    }

    // Safety: the exporter populated `raw` per the C Data Interface
    let mut array = unsafe { ImportedArray::try_from_raw(&mut raw, DataType::Int32)? };
    for line in render_preview(&array, config.preview_len)? {
        writeln!(out, "{line}")?;
    }

    array.release()?;
    tracing::info!(length = config.length, "released exported record");
    Ok(())
}
