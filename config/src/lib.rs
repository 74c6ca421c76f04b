//! Configuration for gx.
//!
//! The on-disk file (`~/.gx/config.toml`, overridable with `GX_CONFIG`) is
//! deserialized into [`GxConfig`]. Callers never read it directly; they take a
//! [`UserSettings`] snapshot through a [`SettingsSource`] at every entry point.

mod persist;
mod settings;

pub use persist::{persist_active_interpreter, persist_ignored_warning};
pub use settings::{FileSettings, SettingsSource, Substitutions, UserSettings};

use std::path::{Path, PathBuf};
use std::{env, fs};

use gx_types::{ImageFormat, SearchMode};
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_ENV_VAR: &str = "GX_CONFIG";

pub const DEFAULT_RENDER_DPI: u32 = 1000;
pub const DEFAULT_LAYER_STYLE: &str = "copper_alpha";
pub const DEFAULT_START_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    pub fn path(&self) -> &Path {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

/// Raw contents of the config file. Every key is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GxConfig {
    pub enable: bool,
    /// Extra arguments appended to the language server command line.
    pub args: Vec<String>,
    /// Interpreter to use instead of discovery. Supports `${userHome}`,
    /// `${workspaceFolder}` and `${cwd}`.
    pub custom_interpreter_path: String,
    pub allow_automatic_fallback: bool,
    pub pygerber_search_mode: SearchMode,
    /// Private install location used in `extension` search mode.
    pub extension_install_directory: Option<String>,
    pub render_dpi: u32,
    pub image_format: ImageFormat,
    pub layer_style: String,
    pub ignored_warnings: Vec<String>,
    pub lsp: LspConfig,
    pub python: PythonConfig,
}

impl Default for GxConfig {
    fn default() -> Self {
        Self {
            enable: true,
            args: Vec::new(),
            custom_interpreter_path: String::new(),
            allow_automatic_fallback: false,
            pygerber_search_mode: SearchMode::default(),
            extension_install_directory: None,
            render_dpi: DEFAULT_RENDER_DPI,
            image_format: ImageFormat::default(),
            layer_style: DEFAULT_LAYER_STYLE.to_string(),
            ignored_warnings: Vec::new(),
            lsp: LspConfig::default(),
            python: PythonConfig::default(),
        }
    }
}

/// `[lsp]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LspConfig {
    /// Upper bound on the wait for a freshly started server to report running.
    pub start_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for LspConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: DEFAULT_START_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

/// `[python]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PythonConfig {
    /// Interpreter the user last activated.
    pub active: Option<String>,
}

impl GxConfig {
    /// Load the config at `path`. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        gx_utils::recover_bak_file(path);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// Load from [`config_path`], or defaults when no home directory exists.
    pub fn load() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }
}

/// `~/.gx`, the root for config, logs, renders and the private install dir.
#[must_use]
pub fn gx_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".gx"))
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    if let Some(path) = env::var_os(CONFIG_ENV_VAR).filter(|p| !p.is_empty()) {
        return Some(PathBuf::from(path));
    }
    gx_dir().map(|dir| dir.join("config.toml"))
}
