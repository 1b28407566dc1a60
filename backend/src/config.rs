//! Runtime configuration.
//!
//! [`CurationOptions`] tune a single run. [`CuratorConfig`] adds the paths
//! and port used by the CLI and server, read from `CURATOR_*` environment
//! variables (a `.env` file is honoured).

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::curation::loader::DEFAULT_BATCH_SIZE;
use crate::error::ConfigError;
use crate::models::{RecordLayout, DEFAULT_STUDY_ID};

/// Wall-clock ceiling of a run when none is configured (one day).
pub const DEFAULT_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 3000;

/// Options for one curation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CurationOptions {
    /// Records per bulk insert.
    pub batch_size: usize,

    /// Seconds before the run is abandoned.
    pub timeout_secs: u64,

    /// Nesting order of the curated records.
    pub layout: RecordLayout,

    /// Cell values treated as missing, in addition to the empty cell.
    pub null_markers: Vec<String>,

    /// Study the records belong to.
    pub study_id: String,
}

impl Default for CurationOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            layout: RecordLayout::default(),
            null_markers: Vec::new(),
            study_id: DEFAULT_STUDY_ID.to_string(),
        }
    }
}

impl CurationOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CuratorConfig {
    /// Field dictionary file (`.json` documents or showcase `.csv`).
    pub fields_path: PathBuf,
    /// Coding table file (`.json` documents or showcase `.csv`).
    pub codings_path: PathBuf,
    /// Directory receiving one NDJSON file per job.
    pub output_dir: PathBuf,
    pub port: u16,
    pub options: CurationOptions,
}

impl Default for CuratorConfig {
    fn default() -> Self {
        Self {
            fields_path: PathBuf::from("data/Data_Dictionary_Showcase.csv"),
            codings_path: PathBuf::from("data/Codings.csv"),
            output_dir: PathBuf::from("output"),
            port: DEFAULT_PORT,
            options: CurationOptions::default(),
        }
    }
}

impl CuratorConfig {
    /// Read the configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(path) = lookup("CURATOR_FIELDS") {
            config.fields_path = path.into();
        }
        if let Some(path) = lookup("CURATOR_CODINGS") {
            config.codings_path = path.into();
        }
        if let Some(dir) = lookup("CURATOR_OUTPUT_DIR") {
            config.output_dir = dir.into();
        }
        if let Some(port) = parse_var(&lookup, "CURATOR_PORT")? {
            config.port = port;
        }
        if let Some(size) = parse_var::<usize, _>(&lookup, "CURATOR_BATCH_SIZE")? {
            if size == 0 {
                return Err(ConfigError {
                    key: "CURATOR_BATCH_SIZE".into(),
                    value: size.to_string(),
                    message: "must be at least 1".into(),
                });
            }
            config.options.batch_size = size;
        }
        if let Some(secs) = parse_var(&lookup, "CURATOR_TIMEOUT_SECS")? {
            config.options.timeout_secs = secs;
        }
        if let Some(layout) = parse_var(&lookup, "CURATOR_LAYOUT")? {
            config.options.layout = layout;
        }
        if let Some(study) = lookup("CURATOR_STUDY") {
            config.options.study_id = study;
        }
        if let Some(markers) = lookup("CURATOR_NULL_MARKERS") {
            config.options.null_markers = markers
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|e: T::Err| ConfigError {
            key: key.to_string(),
            value: raw.clone(),
            message: e.to_string(),
        }),
    }
}
