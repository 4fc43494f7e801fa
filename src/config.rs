//! Configuration system for oob-bootstrap
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (OOB_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::comm::ThreadMode;
use crate::error::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Store rendezvous settings
    pub rendezvous: RendezvousSettings,

    /// Communication library settings
    pub library: LibrarySettings,

    /// Comms trace settings
    pub tracing: TraceSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Store rendezvous settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousSettings {
    /// Key prefix every peer of a group must share
    pub namespace: String,

    /// Sleep between polls in blocking drivers (ms)
    pub poll_interval_ms: u64,

    /// Bound on distributed waits (ms, 0 = wait forever)
    pub wait_timeout_ms: u64,
}

/// Communication library settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibrarySettings {
    /// Environment prefix the library reads its options from
    pub config_prefix: String,

    /// Thread mode required from the library
    pub thread_mode: ThreadMode,

    /// Endpoint estimate (defaults to the peer count)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_num_eps: Option<usize>,
}

/// Comms trace settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceSettings {
    /// Record submitted operations
    pub enabled: bool,

    /// Output directory (OOB_COMMS_TRACE_OUTPUT_DIR still wins)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// ─────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────

impl Default for RendezvousSettings {
    fn default() -> Self {
        Self {
            namespace: "oob".to_string(),
            poll_interval_ms: 1,
            wait_timeout_ms: 0,
        }
    }
}

impl Default for LibrarySettings {
    fn default() -> Self {
        Self {
            config_prefix: "OOB".to_string(),
            thread_mode: ThreadMode::Multi,
            estimated_num_eps: None,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl BootstrapConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|source| Error::IoRead {
                path: path.clone(),
                source,
            })?;
            config = Self::parse(&content)?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        config.apply_env_overrides()?;
        config.expand_paths();
        config.validate()?;

        Ok(config)
    }

    /// Parse TOML content without applying overrides
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::ConfigParse {
            message: e.to_string(),
            source: Some(e),
        })
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::ConfigNotFound { path });
        }

        let search_paths = [
            PathBuf::from("oob-bootstrap.toml"),
            dirs::config_dir()
                .map(|p| p.join("oob-bootstrap").join("config.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".oob-bootstrap").join("config.toml"))
                .unwrap_or_default(),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        // Rendezvous settings
        if let Ok(val) = std::env::var("OOB_NAMESPACE") {
            self.rendezvous.namespace = val;
        }
        if let Some(val) = env_parse("OOB_POLL_INTERVAL_MS")? {
            self.rendezvous.poll_interval_ms = val;
        }
        if let Some(val) = env_parse("OOB_WAIT_TIMEOUT_MS")? {
            self.rendezvous.wait_timeout_ms = val;
        }

        // Library settings
        if let Ok(val) = std::env::var("OOB_CONFIG_PREFIX") {
            self.library.config_prefix = val;
        }
        if let Some(val) = env_parse("OOB_ESTIMATED_NUM_EPS")? {
            self.library.estimated_num_eps = Some(val);
        }

        // Trace settings
        if let Ok(val) = std::env::var("OOB_TRACE_ENABLED") {
            self.tracing.enabled = val == "1" || val.eq_ignore_ascii_case("true");
        }
        if let Ok(val) = std::env::var("OOB_TRACE_DIR") {
            self.tracing.output_dir = Some(val);
        }

        // Logging settings
        if let Ok(val) = std::env::var("OOB_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("OOB_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("OOB_LOG_JSON") {
            self.logging.json_format = val == "1" || val.eq_ignore_ascii_case("true");
        }

        Ok(())
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref dir) = self.tracing.output_dir {
            self.tracing.output_dir = Some(expand_path(dir));
        }
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.rendezvous.namespace.contains(char::is_whitespace) {
            return Err(Error::config_field_invalid(
                "rendezvous.namespace",
                "namespace must not contain whitespace",
            ));
        }

        if self.library.config_prefix.is_empty() {
            return Err(Error::config_field_invalid(
                "library.config_prefix",
                "config prefix cannot be empty",
            ));
        }

        if self.library.thread_mode != ThreadMode::Multi {
            return Err(Error::config_field_invalid(
                "library.thread_mode",
                format!(
                    "thread mode '{}' is not supported, progress must be callable from any thread (use 'multi')",
                    self.library.thread_mode
                ),
            ));
        }

        if self.library.estimated_num_eps == Some(0) {
            return Err(Error::config_field_invalid(
                "library.estimated_num_eps",
                "estimated endpoint count must be positive",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Trace output directory, if configured
    pub fn trace_dir(&self) -> Option<PathBuf> {
        self.tracing.output_dir.as_ref().map(PathBuf::from)
    }
}

/// Parse a numeric environment override
fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(val) => val.trim().parse().map(Some).map_err(|_| {
            Error::config_field_invalid(name, format!("'{}' is not a valid number", val))
        }),
        Err(_) => Ok(None),
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or_else(|_| std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Default location written by `config init`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("oob-bootstrap")
        .join("config.toml")
}

/// Initialize a new configuration file, returning its path
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(default_config_path);

    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).map_err(|source| Error::IoWrite {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|source| Error::IoWrite {
        path: config_path.clone(),
        source,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# oob-bootstrap configuration

[rendezvous]
# Store key prefix; every peer of a group must use the same one
namespace = "oob"

# Sleep between rendezvous polls in milliseconds
poll_interval_ms = 1

# Bound on distributed waits in milliseconds (0 = wait forever)
wait_timeout_ms = 0

[library]
# Environment prefix the communication library reads options from
config_prefix = "OOB"

# Required thread mode (only "multi" is supported)
thread_mode = "multi"

# Endpoint estimate passed to the library (defaults to the peer count)
# estimated_num_eps = 16

[tracing]
# Record every submitted operation and flush rank<N>.json on exit
enabled = false

# Output directory (OOB_COMMS_TRACE_OUTPUT_DIR overrides it)
# output_dir = "~/oob-traces"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.oob-bootstrap/logs/oob-bootstrap.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
    .to_string()
}
