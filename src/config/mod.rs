//! Configuration management
//!
//! This module handles loading and parsing configuration for the media
//! relation engine. Configuration can be loaded from:
//! - config.yml file
//! - Environment variables (override file settings)
//!
//! Missing optional values are filled with sensible defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::models::RelationVariant;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Payload storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database driver (sqlite or mysql)
    #[serde(default)]
    pub driver: DatabaseDriver,
    /// Database connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: DatabaseDriver::default(),
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "data/mediarel.db".to_string()
}

/// Database driver type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    /// SQLite (default)
    #[default]
    Sqlite,
    /// MySQL
    Mysql,
}

/// Payload storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory all stored paths are relative to
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
    /// Sub-directory for image payloads
    #[serde(default = "default_images_dir")]
    pub images_dir: String,
    /// Sub-directory for file payloads
    #[serde(default = "default_files_dir")]
    pub files_dir: String,
    /// Prefix the thumbnailer puts in front of derivative file names
    #[serde(default)]
    pub thumbnail_prefix: String,
    /// Directory (relative to the payload's directory) derivatives live in
    #[serde(default)]
    pub thumbnail_subdir: String,
    /// Maximum payload size in bytes (default: 10MB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            images_dir: default_images_dir(),
            files_dir: default_files_dir(),
            thumbnail_prefix: String::new(),
            thumbnail_subdir: String::new(),
            max_file_size: default_max_file_size(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_images_dir() -> String {
    "images".to_string()
}

fn default_files_dir() -> String {
    "files".to_string()
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024 // 10MB
}

impl StorageConfig {
    /// Directory new payloads of `variant` are written to, if the variant
    /// stores payloads at all
    pub fn upload_dir(&self, variant: RelationVariant) -> Option<&str> {
        match variant {
            RelationVariant::Image => Some(&self.images_dir),
            RelationVariant::File => Some(&self.files_dir),
            RelationVariant::Video => None,
        }
    }
}

/// Error type for configuration parsing
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to parse config file '{path}': {message}")]
    ParseError { path: String, message: String },
}

impl Config {
    /// Load configuration from file
    ///
    /// If the file doesn't exist, returns default configuration.
    /// If the file exists but is invalid YAML, returns an error with details.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.display().to_string(),
            source: e,
        })?;

        // Handle empty file - return defaults
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError {
                path: path.display().to_string(),
                message: format_yaml_error(&e),
            })?;

        Ok(config)
    }

    /// Load configuration from file with environment variable overrides
    ///
    /// Environment variables follow the pattern:
    /// - MEDIAREL_DATABASE_DRIVER
    /// - MEDIAREL_DATABASE_URL
    /// - MEDIAREL_STORAGE_ROOT
    /// - MEDIAREL_STORAGE_THUMBNAIL_PREFIX
    /// - MEDIAREL_STORAGE_THUMBNAIL_SUBDIR
    /// - MEDIAREL_STORAGE_MAX_FILE_SIZE
    pub fn load_with_env(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    fn apply_env_overrides(&mut self) {
        if let Ok(driver) = std::env::var("MEDIAREL_DATABASE_DRIVER") {
            match driver.to_lowercase().as_str() {
                "sqlite" => self.database.driver = DatabaseDriver::Sqlite,
                "mysql" => self.database.driver = DatabaseDriver::Mysql,
                _ => {} // Ignore invalid values
            }
        }
        if let Ok(url) = std::env::var("MEDIAREL_DATABASE_URL") {
            self.database.url = url;
        }

        if let Ok(root) = std::env::var("MEDIAREL_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(root);
        }
        if let Ok(prefix) = std::env::var("MEDIAREL_STORAGE_THUMBNAIL_PREFIX") {
            self.storage.thumbnail_prefix = prefix;
        }
        if let Ok(subdir) = std::env::var("MEDIAREL_STORAGE_THUMBNAIL_SUBDIR") {
            self.storage.thumbnail_subdir = subdir;
        }
        if let Ok(size) = std::env::var("MEDIAREL_STORAGE_MAX_FILE_SIZE") {
            if let Ok(size) = size.parse::<u64>() {
                self.storage.max_file_size = size;
            }
        }
    }
}

/// Format YAML parsing error with location and context
fn format_yaml_error(e: &serde_yaml::Error) -> String {
    if let Some(location) = e.location() {
        format!(
            "at line {}, column {}: {}",
            location.line(),
            location.column(),
            e
        )
    } else {
        e.to_string()
    }
}

// Shared mutex for all config tests that modify environment variables.
#[cfg(test)]
static CONFIG_ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
const ENV_KEYS: &[&str] = &[
    "MEDIAREL_DATABASE_DRIVER",
    "MEDIAREL_DATABASE_URL",
    "MEDIAREL_STORAGE_ROOT",
    "MEDIAREL_STORAGE_THUMBNAIL_PREFIX",
    "MEDIAREL_STORAGE_THUMBNAIL_SUBDIR",
    "MEDIAREL_STORAGE_MAX_FILE_SIZE",
];

#[cfg(test)]
fn clear_env() {
    for key in ENV_KEYS {
        std::env::remove_var(key);
    }
}
