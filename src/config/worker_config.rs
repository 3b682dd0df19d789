//! Worker configuration structs with serde defaults
//!
//! Every section is `#[serde(default)]`, so a partial TOML file only needs
//! the keys it changes:
//!
//! ```toml
//! [worker]
//! poll_interval_secs = 30
//!
//! [companion]
//! backend_url = "http://10.0.0.5:5001"
//!
//! [schedule]
//! path = "/etc/batchline/schedule.json"
//!
//! [schedule.default_assignment]
//! 1 = "R_100_140_1000_0_NA_NA"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::defaults;
use crate::types::{Gate, REJECT_GATE};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "BATCHLINE_CONFIG";
pub const BACKEND_URL_ENV: &str = "BATCHLINE_BACKEND_URL";
pub const SHARED_SECRET_ENV: &str = "BATCHLINE_SHARED_SECRET";
pub const DATA_DIR_ENV: &str = "BATCHLINE_DATA_DIR";

// ============================================================================
// Top-level Config
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub worker: WorkerSection,

    #[serde(default)]
    pub companion: CompanionConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl WorkerConfig {
    /// Load configuration using the standard search order:
    /// 1. `$BATCHLINE_CONFIG` environment variable
    /// 2. `./batchline.toml` in the current working directory
    /// 3. Built-in defaults
    ///
    /// Environment overrides are applied to whichever source won.
    pub fn load() -> Self {
        let mut config = Self::load_file_or_default();
        config.apply_env_overrides();
        config
    }

    fn load_file_or_default() -> Self {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded worker config from {}", CONFIG_ENV);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {}, falling back", CONFIG_ENV);
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", CONFIG_ENV);
            }
        }

        let local = PathBuf::from(defaults::CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded worker config from ./{}", defaults::CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", defaults::CONFIG_FILE);
                }
            }
        }

        info!("No {} found, using built-in defaults", defaults::CONFIG_FILE);
        Self::default()
    }

    /// Load and validate a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Apply `BATCHLINE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = get(BACKEND_URL_ENV) {
            self.companion.backend_url = url;
        }
        if let Some(secret) = get(SHARED_SECRET_ENV) {
            self.companion.shared_secret = Some(secret);
        }
        if let Some(dir) = get(DATA_DIR_ENV) {
            self.worker.data_dir = PathBuf::from(dir);
        }
    }

    /// Check every section, collecting all problems.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.worker.poll_interval_secs == 0 {
            errors.push("worker.poll_interval_secs must be > 0".to_string());
        }
        if self.worker.max_gap_minutes == 0 {
            errors.push("worker.max_gap_minutes must be > 0".to_string());
        }
        if self.worker.data_dir.as_os_str().is_empty() {
            errors.push("worker.data_dir must not be empty".to_string());
        }

        if self.companion.enabled {
            let url = self.companion.backend_url.trim();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(format!(
                    "companion.backend_url must start with http:// or https:// (got '{url}')"
                ));
            }
            if self.companion.timeout_ms == 0 {
                errors.push("companion.timeout_ms must be > 0".to_string());
            }
        }

        for gate in self.schedule.default_assignment.keys() {
            match gate.trim().parse::<Gate>() {
                Ok(REJECT_GATE) => errors.push(format!(
                    "schedule.default_assignment: gate {REJECT_GATE} is the reject gate and cannot carry a recipe"
                )),
                Ok(_) => {}
                Err(_) => errors.push(format!(
                    "schedule.default_assignment: '{gate}' is not a gate number"
                )),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Worker Section
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub poll_interval_secs: u64,
    pub data_dir: PathBuf,
    /// Caps how many empty windows one rollover may emit.
    pub max_gap_minutes: u32,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: defaults::POLL_INTERVAL_SECS,
            data_dir: PathBuf::from(defaults::DATA_DIR),
            max_gap_minutes: defaults::MAX_GAP_MINUTES,
        }
    }
}

impl WorkerSection {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(defaults::DB_SUBDIR)
    }
}

// ============================================================================
// Companion Section
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    pub enabled: bool,
    pub backend_url: String,
    pub shared_secret: Option<String>,
    pub timeout_ms: u64,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend_url: defaults::COMPANION_BACKEND_URL.to_string(),
            shared_secret: None,
            timeout_ms: defaults::COMPANION_TIMEOUT_MS,
        }
    }
}

impl CompanionConfig {
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ============================================================================
// Schedule Section
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Program-assignment JSON; without it the default assignment runs as a
    /// single program.
    pub path: Option<PathBuf>,
    pub wrap_minutes: u64,
    /// Gate number (as a string key) to recipe name.
    pub default_assignment: BTreeMap<String, String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            path: None,
            wrap_minutes: defaults::SCHEDULE_WRAP_MINUTES,
            default_assignment: BTreeMap::new(),
        }
    }
}

impl ScheduleConfig {
    /// Default assignment with numeric gates. Entries that fail to parse
    /// are dropped; `validate` reports them.
    pub fn default_gate_names(&self) -> BTreeMap<Gate, String> {
        self.default_assignment
            .iter()
            .filter_map(|(gate, name)| Some((gate.trim().parse::<Gate>().ok()?, name.clone())))
            .collect()
    }
}
