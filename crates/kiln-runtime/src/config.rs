//! kiln.yaml configuration.
//!
//! Every field is optional; command-line flags override what the file says.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE: &str = "kiln.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    pub window: WindowConfig,
    /// Log filter used when RUST_LOG is unset.
    pub log: String,
    pub default_demo: String,
    /// Validate generated WGSL with naga before creating programs.
    pub validate: bool,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            log: "info".to_string(),
            default_demo: "gradient".to_string(),
            validate: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "kiln".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Walk up from `start_dir` looking for `kiln.yaml`.
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    let mut dir = start_dir.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE);
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Load and parse a `kiln.yaml` file.
pub fn load_config(path: &Path) -> Result<KilnConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&contents).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

pub fn parse_config(contents: &str) -> Result<KilnConfig, serde_yaml::Error> {
    if contents.trim().is_empty() {
        return Ok(KilnConfig::default());
    }
    serde_yaml::from_str(contents)
}

/// An explicit path, else the nearest kiln.yaml, else defaults.
pub fn resolve(explicit: Option<&str>) -> Result<(KilnConfig, Option<PathBuf>), ConfigError> {
    let path = match explicit {
        Some(path) => Some(PathBuf::from(path)),
        None => std::env::current_dir()
            .ok()
            .and_then(|cwd| find_config(&cwd)),
    };
    match path {
        Some(path) => Ok((load_config(&path)?, Some(path))),
        None => Ok((KilnConfig::default(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = parse_config("window:\n  width: 800\nvalidate: false\n").unwrap();
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.window.title, "kiln");
        assert!(!config.validate);
        assert_eq!(config.log, "info");
    }

    #[test]
    fn test_empty_file_is_default() {
        let config = parse_config("  \n").unwrap();
        assert_eq!(config.default_demo, "gradient");
        assert!(config.window.vsync);
    }

    #[test]
    fn test_bad_types_rejected() {
        assert!(parse_config("window:\n  width: wide\n").is_err());
    }

    #[test]
    fn test_find_config_walks_up() {
        let root = std::env::temp_dir().join(format!("kiln-config-{}", std::process::id()));
        let nested = root.join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(root.join(CONFIG_FILE), "log: debug\n").unwrap();

        let found = find_config(&nested).unwrap();
        assert_eq!(found, root.join(CONFIG_FILE));
        assert_eq!(load_config(&found).unwrap().log, "debug");

        std::fs::remove_dir_all(&root).unwrap();
    }
}
