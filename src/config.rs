//! Toolkit configuration
//!
//! Loaded from TOML at `$XCBKIT_CONFIG` or `~/.config/xcbkit/config.toml`.
//! Every section is optional; missing keys fall back to the defaults below.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::connection::ConnectFlags;
use crate::window::GlRequest;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "XCBKIT_CONFIG";

/// Errors while reading or writing the config file
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no config directory for this user")]
    NoConfigDir,
    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub gl: GlConfig,
    pub event_loop: EventLoopConfig,
    pub window: WindowConfig,
}

impl Config {
    /// Load configuration from file, or use defaults if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        if !path.exists() {
            info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        info!("Configuration loaded from {:?}", path);
        debug!("Config: {:?}", config);
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Path of the config file, honoring `$XCBKIT_CONFIG`
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(path));
        }
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(dir.join("xcbkit").join("config.toml"))
    }

    /// Write the default configuration to `path`
    pub fn save_default(path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let text = toml::to_string_pretty(&Self::default())?;
        fs::write(path, text).map_err(io_err)?;
        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// How to reach the X server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Display name; `$DISPLAY` when unset
    pub display: Option<String>,
    /// Open through Xlib so GL windows can be created
    pub use_gl: bool,
    /// Intern the common atoms while connecting
    pub init_atoms: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            display: None,
            use_gl: true,
            init_atoms: true,
        }
    }
}

impl ConnectionConfig {
    pub fn flags(&self) -> ConnectFlags {
        let mut flags = ConnectFlags::empty();
        flags.set(ConnectFlags::USE_GL, self.use_gl);
        flags.set(ConnectFlags::INIT_ATOMS, self.init_atoms);
        flags
    }
}

/// GL context version requested for GL windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlConfig {
    pub major: u8,
    pub minor: u8,
    /// Request a debug context
    pub debug: bool,
}

impl Default for GlConfig {
    fn default() -> Self {
        Self {
            major: 3,
            minor: 0,
            debug: false,
        }
    }
}

impl GlConfig {
    pub fn request(&self) -> GlRequest {
        GlRequest {
            major: self.major,
            minor: self.minor,
            debug: self.debug,
        }
    }
}

/// Own event loop tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLoopConfig {
    /// Longest the blocking loop sleeps before re-checking its exit flag
    pub idle_wakeup_ms: u64,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self { idle_wakeup_ms: 100 }
    }
}

/// Initial top-level window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u16,
    pub height: u16,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "xcbkit".to_string(),
            width: 640,
            height: 480,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.event_loop.idle_wakeup_ms, 100);
        assert!(config.connection.use_gl);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml_str(
            r#"
            [connection]
            display = ":1"
            use_gl = false

            [gl]
            major = 2
            minor = 1
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.display.as_deref(), Some(":1"));
        assert!(config.connection.init_atoms);
        assert_eq!(config.connection.flags(), ConnectFlags::INIT_ATOMS);
        assert_eq!(config.gl.request(), GlRequest { major: 2, minor: 1, debug: false });
        assert_eq!(config.window.title, "xcbkit");
    }

    #[test]
    fn test_bad_toml_is_reported() {
        let err = Config::from_toml_str("[gl]\nmajor = \"three\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_default_roundtrips_through_file() {
        let dir = std::env::temp_dir().join(format!("xcbkit-config-{}", std::process::id()));
        let path = dir.join("config.toml");
        Config::save_default(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), Config::default());
        let _ = fs::remove_dir_all(&dir);
    }
}
