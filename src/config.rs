//! Runtime configuration (`qnative.toml`)

use crate::logging::{parse_level, LogConfig, LogFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "qnative.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write config '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub runtime: RuntimeSection,

    #[serde(default)]
    pub logging: LoggingSection,

    #[serde(default)]
    pub libraries: Vec<LibraryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSection {
    /// Call each initialized library's `nativescript_frame` from `Runtime::frame`
    #[serde(default = "default_true")]
    pub call_frame_hooks: bool,

    /// Call `nativescript_thread_enter`/`_exit` from `Runtime::thread_enter`/`thread_exit`
    #[serde(default = "default_true")]
    pub call_thread_hooks: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub name: String,
    pub path: String,

    /// Open and initialize on `Runtime::init`
    #[serde(default = "default_false")]
    pub preload: bool,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            call_frame_hooks: true,
            call_thread_hooks: true,
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
            file: None,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_level() -> String {
    "info".to_string()
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Find and load `qnative.toml` from the current directory or its parents
    pub fn discover() -> Self {
        match std::env::current_dir() {
            Ok(dir) => Self::discover_from(&dir),
            Err(_) => Self::default(),
        }
    }

    pub fn discover_from(start: &Path) -> Self {
        let mut current = Some(start.to_path_buf());

        while let Some(dir) = current {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                if let Ok(config) = Self::load(&config_path) {
                    return config;
                }
            }
            current = dir.parent().map(|p| p.to_path_buf());
        }

        Self::default()
    }

    /// Default configuration file content
    pub fn generate_default() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# failed to generate config"))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn preloaded(&self) -> impl Iterator<Item = &LibraryConfig> {
        self.libraries.iter().filter(|lib| lib.preload)
    }

    /// Logging settings, with `QNATIVE_LOG_*` variables taking precedence
    pub fn log_config(&self) -> LogConfig {
        let mut config = LogConfig::new()
            .with_level(parse_level(&self.logging.level).unwrap_or(crate::logging::Level::INFO))
            .with_format(self.logging.format);
        if let Some(file) = &self.logging.file {
            config = config.with_file(file.clone());
        }

        let env = LogConfig::from_env();
        if std::env::var("QNATIVE_LOG_LEVEL").is_ok() {
            config.level = env.level;
        }
        if env.log_path.is_some() {
            config.log_path = env.log_path;
        }
        if env.format == LogFormat::Json {
            config.format = LogFormat::Json;
        }
        config.show_spans = env.show_spans;
        config
    }
}
