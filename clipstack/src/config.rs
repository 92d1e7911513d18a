//! History configuration
//!
//! Built once at startup (defaults, or a TOML file) and handed to
//! `ClipboardHistory::open`. Nothing reads settings from global state.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cleanup::RetentionPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Cannot serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Capture filter matched against the owner's executable path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerFilter {
    pub name: String,
    /// Exact path or glob (`*`, `?`), compared case-insensitively
    pub pattern: String,
    #[serde(default)]
    pub filtered_count: u64,
}

impl OwnerFilter {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            filtered_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Directory holding the database and the payload folders
    #[serde(default = "default_history_root")]
    pub history_root: PathBuf,
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// Favorites are evicted by retention too
    #[serde(default)]
    pub include_favorites: bool,
    #[serde(default = "default_true")]
    pub link_preview_enabled: bool,
    /// Only `#RRGGBB`-style text counts as a color when set
    #[serde(default = "default_true")]
    pub hex_color_prefix_required: bool,
    #[serde(default)]
    pub owner_filters: Vec<OwnerFilter>,
}

fn default_true() -> bool {
    true
}

/// `<local data dir>/clipstack/History`, or `./History` when the platform has none
pub fn default_history_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("clipstack"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("History")
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self::with_root(default_history_root())
    }
}

impl HistoryConfig {
    pub fn with_root(history_root: impl Into<PathBuf>) -> Self {
        Self {
            history_root: history_root.into(),
            retention: RetentionPolicy::default(),
            include_favorites: false,
            link_preview_enabled: true,
            hex_color_prefix_required: true,
            owner_filters: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Defaults when the file does not exist yet
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.history_root.join(crate::database::DATABASE_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::CleanupTimeSpan;

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config: HistoryConfig = toml::from_str(r#"history_root = "/tmp/h""#).unwrap();
        assert_eq!(config.history_root, PathBuf::from("/tmp/h"));
        assert_eq!(config.retention, RetentionPolicy::None);
        assert!(config.link_preview_enabled);
        assert!(config.owner_filters.is_empty());
    }

    #[test]
    fn test_retention_variants_parse() {
        let config: HistoryConfig = toml::from_str(
            r#"
            history_root = "/tmp/h"
            include_favorites = true

            [retention.period]
            span = "week"
            "#,
        )
        .unwrap();
        assert_eq!(
            config.retention,
            RetentionPolicy::Period { span: CleanupTimeSpan::Week }
        );
        assert!(config.include_favorites);

        let config: HistoryConfig = toml::from_str(
            r#"
            [retention.quantity]
            max_clips = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.retention, RetentionPolicy::Quantity { max_clips: 50 });
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/clipstack.toml");
        let mut config = HistoryConfig::with_root(dir.path().join("History"));
        config.owner_filters.push(OwnerFilter::new("Passwords", "C:/Apps/*/keepass.exe"));
        config.save(&path).unwrap();

        let loaded = HistoryConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
