use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Current version of the options file schema
pub const CURRENT_OPTIONS_VERSION: u32 = 1;

const MIN_SAMPLE_INTERVAL_MS: u64 = 10;
const MAX_SAMPLE_INTERVAL_MS: u64 = 10_000;

/// Knobs for one discovery run, loadable from a JSON file.
///
/// Missing keys fall back to their defaults, so an empty object is a valid file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryOptions {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Sample the cycle counter on every core to estimate clock speed
    #[serde(default)]
    pub measure_clock_speed: bool,
    /// Ignore any memoized profile and probe again
    #[serde(default)]
    pub invalidate_cache: bool,
    /// Wall-clock window per core while sampling the cycle counter
    #[serde(default = "default_sample_interval")]
    pub clock_sample_interval_ms: u64,
    /// Restrict per-core workers to their core through the OS scheduler
    #[serde(default = "default_pin_threads")]
    pub pin_threads: bool,
}

fn default_version() -> u32 {
    CURRENT_OPTIONS_VERSION
}
fn default_sample_interval() -> u64 {
    100
}
fn default_pin_threads() -> bool {
    true
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            version: CURRENT_OPTIONS_VERSION,
            measure_clock_speed: false,
            invalidate_cache: false,
            clock_sample_interval_ms: default_sample_interval(),
            pin_threads: default_pin_threads(),
        }
    }
}

impl DiscoveryOptions {
    /// Reads options from `path` and validates them.
    ///
    /// Fields missing from the file take their defaults, so an options file
    /// written by an older build still loads.
    ///
    /// # Returns
    ///
    /// The options, or a [`ConfigError`] naming the file when it cannot be
    /// read, does not parse, or holds an out-of-range value.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let options: DiscoveryOptions =
            serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        options.validate()?;
        Ok(options)
    }

    /// Options file next to the executable, the way the state file is located.
    pub fn default_path() -> PathBuf {
        std::env::current_exe()
            .map(|mut p| {
                p.set_file_name("cpu-topology.json");
                p
            })
            .unwrap_or_else(|_| "cpu-topology.json".into())
    }

    /// Loads from [`DiscoveryOptions::default_path`], falling back to defaults
    /// when the file does not exist.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Writes the options as pretty JSON, replacing any existing file.
    pub fn save_to_path(&self, path: &Path) -> Result<(), ConfigError> {
        serde_json::to_string_pretty(self)
            .map_err(std::io::Error::from)
            .and_then(|json| std::fs::write(path, json))
            .map_err(|source| ConfigError::Write {
                path: path.display().to_string(),
                source,
            })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version > CURRENT_OPTIONS_VERSION {
            return Err(ConfigError::InvalidValue {
                key: "version".into(),
                value: self.version.to_string(),
                reason: format!("newest supported version is {CURRENT_OPTIONS_VERSION}"),
            });
        }
        if !(MIN_SAMPLE_INTERVAL_MS..=MAX_SAMPLE_INTERVAL_MS).contains(&self.clock_sample_interval_ms)
        {
            return Err(ConfigError::InvalidValue {
                key: "clock_sample_interval_ms".into(),
                value: self.clock_sample_interval_ms.to_string(),
                reason: format!(
                    "must be between {MIN_SAMPLE_INTERVAL_MS} and {MAX_SAMPLE_INTERVAL_MS}"
                ),
            });
        }
        Ok(())
    }
}
