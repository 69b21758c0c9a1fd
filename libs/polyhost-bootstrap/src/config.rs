use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use polyhost::ContextConfig;

use crate::paths::home_dir::resolve_home_dir;

/// Prefix of environment overrides, e.g. `POLYHOST__CONTEXT__SANDBOX=isolated`.
pub const ENV_PREFIX: &str = "POLYHOST__";

const DEFAULT_SUBDIR: &str = ".polyhost";

/// Configuration of an embedding host: where it lives, how it logs and the
/// configuration its contexts start with.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Normalized to an absolute path on load. Empty means the platform default.
    #[serde(default)]
    pub home_dir: String,
    /// Initial configuration of every context created by the host.
    #[serde(default)]
    pub context: ContextConfig,
    /// Logging configuration (optional, uses defaults if None).
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

/// Logging configuration - maps target prefixes to their logging settings.
/// Key "default" is the catch-all for records no other section matches.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Section {
    /// "trace", "debug", "info", "warn", "error" or "off"
    pub console_level: String,
    /// Log file, relative to the home directory; empty disables the file sink.
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub file_level: String,
    #[serde(default)]
    pub max_age_days: Option<u32>,
    /// How many rotated files to keep.
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

/// Create a default logging configuration.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "info".to_string(),
            file: "logs/polyhost.log".to_string(),
            file_level: "debug".to_string(),
            max_age_days: Some(7),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl HostConfig {
    /// Load configuration with layered loading: defaults → YAML file → environment variables.
    /// Also normalizes `home_dir` into an absolute path and creates the directory.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        let path = config_path.as_ref();
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }

        let figment = Figment::new()
            .merge(Serialized::defaults(HostConfig::default()))
            .merge(Yaml::file(path))
            // POLYHOST__CONTEXT__POLL_INTERVAL=20ms maps to context.poll_interval
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: HostConfig = figment
            .extract()
            .with_context(|| format!("Failed to extract config from {}", path.display()))?;

        config
            .normalize_home_dir()
            .context("Failed to resolve home_dir")?;
        tracing::debug!(path = %path.display(), home_dir = %config.home_dir, "Host configuration loaded");
        Ok(config)
    }

    /// Load configuration from file or fall back to defaults with the default logging setup.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        match config_path {
            Some(path) => Self::load_layered(path),
            None => {
                let mut c = Self {
                    logging: Some(default_logging_config()),
                    ..Self::default()
                };
                c.normalize_home_dir()
                    .context("Failed to resolve home_dir (defaults)")?;
                Ok(c)
            }
        }
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    pub fn home_path(&self) -> PathBuf {
        PathBuf::from(&self.home_dir)
    }

    /// Logging sections to install; the defaults when none are configured.
    pub fn logging_or_default(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_else(default_logging_config)
    }

    fn normalize_home_dir(&mut self) -> Result<()> {
        let resolved = resolve_home_dir(Some(self.home_dir.as_str()), DEFAULT_SUBDIR, true)?;
        self.home_dir = resolved.to_string_lossy().to_string();
        Ok(())
    }
}
