//! Configuration Module - plugin declarations from OrcTimeline.yaml
//!
//! The configuration maps plugin names to the archives, nested sub-archives
//! and member patterns they consume. Every declared sub-archive is fanned
//! out into its own independent pipeline unit so plugin instances stay
//! parallelizable. All validation errors are fatal before processing starts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::plugins;

pub const DEFAULT_CONFIG_FILE: &str = "OrcTimeline.yaml";

/// Configuration shipped in the binary, written out by `init-conf`.
pub const DEFAULT_CONFIG: &str = include_str!("data/OrcTimeline.yaml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read configuration file \"{0}\" (file does not exist)")]
    Missing(PathBuf),

    #[error("Cannot read configuration file \"{0}\" (is not a file)")]
    NotAFile(PathBuf),

    #[error("Cannot read configuration file \"{path}\": {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("An error occurred while parsing configuration (file: {path}): {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

/// One pipeline unit: a plugin paired with the archives it reads.
///
/// After fan-out `sub_archives` holds at most one entry; an empty list means
/// members are taken straight from the outer archive.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub plugin_name: String,
    pub archives: Vec<String>,
    pub sub_archives: Vec<String>,
    pub match_pattern: Regex,
    pub sourcetype: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "Plugins")]
    plugins: Vec<BTreeMap<String, RawPlugin>>,
}

#[derive(Debug, Deserialize)]
struct RawPlugin {
    archives: Option<Vec<String>>,
    #[serde(default)]
    sub_archives: Option<Vec<String>>,
    #[serde(default)]
    match_pattern: String,
    #[serde(default)]
    sourcetype: String,
}

/// Loaded and validated plugin configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub plugin_configs: Vec<PluginConfig>,
    pub path: PathBuf,
}

impl Config {
    /// Load the configuration from `path`, or from the default location.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        if !path.exists() {
            return Err(ConfigError::Missing(path));
        }
        if !path.is_file() {
            return Err(ConfigError::NotAFile(path));
        }

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        Self::from_str(&content, path)
    }

    /// Parse and validate a configuration document.
    pub fn from_str(content: &str, path: PathBuf) -> Result<Self, ConfigError> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;

        let mut plugin_configs = Vec::new();
        for entry in &raw.plugins {
            for (name, plugin) in entry {
                plugin_configs.extend(fan_out(name, plugin)?);
            }
        }

        if plugin_configs.is_empty() {
            return Err(ConfigError::Invalid("Plugin list seems empty.".to_string()));
        }

        Ok(Self {
            plugin_configs,
            path,
        })
    }

    /// Default configuration path under the user configuration directory.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "tunclon", "orc-timeline")
            .map(|dirs| dirs.config_dir().join(DEFAULT_CONFIG_FILE))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Write the embedded default configuration to `path`.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, DEFAULT_CONFIG)
    }
}

/// Validate one declaration and fan it out into independent units, one per
/// sub-archive (or a single unit when no sub-archives are declared).
fn fan_out(name: &str, raw: &RawPlugin) -> Result<Vec<PluginConfig>, ConfigError> {
    if name.is_empty() {
        return Err(ConfigError::Invalid(
            "Empty plugin name in configuration is not allowed.".to_string(),
        ));
    }
    if !plugins::is_registered(name) {
        return Err(ConfigError::Invalid(format!(
            "Plugin {name}: no registered plugin with this name."
        )));
    }

    let archives = raw.archives.clone().unwrap_or_default();
    if archives.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "Plugin {name}: configuration describes plugin without any archive."
        )));
    }
    if raw.sourcetype.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "Plugin {name}: empty sourcetype is not allowed."
        )));
    }
    if raw.match_pattern.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "Plugin {name}: empty match_pattern is not allowed. \
             Hint: \".*\" can be used to match all the files."
        )));
    }

    let match_pattern = Regex::new(&raw.match_pattern).map_err(|e| {
        ConfigError::Invalid(format!("Plugin {name}: invalid match_pattern: {e}"))
    })?;

    let sub_archives = raw.sub_archives.clone().unwrap_or_default();
    let fanned = if sub_archives.is_empty() {
        vec![PluginConfig {
            plugin_name: name.to_string(),
            archives,
            sub_archives: Vec::new(),
            match_pattern,
            sourcetype: raw.sourcetype.clone(),
        }]
    } else {
        sub_archives
            .into_iter()
            .map(|sub| PluginConfig {
                plugin_name: name.to_string(),
                archives: archives.clone(),
                sub_archives: vec![sub],
                match_pattern: match_pattern.clone(),
                sourcetype: raw.sourcetype.clone(),
            })
            .collect()
    };

    Ok(fanned)
}
