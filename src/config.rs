use crate::error::{HistoryError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the directory holding every history below the data root
pub const DATA_DIRECTORY: &str = "history_ver1.0";

/// Configuration settings for the history store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Custom root directory for histories (if not using system default)
    pub data_dir: Option<PathBuf>,

    /// Keep parsed documents in memory between reads
    #[serde(default)]
    pub cache_enabled: bool,

    /// Upper bound on parsed documents kept per history when caching is on
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    /// Records written to a data file before the writer starts a new one
    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            cache_enabled: false,
            cache_capacity: default_cache_capacity(),
            max_records_per_file: default_max_records_per_file(),
        }
    }
}

impl HistoryConfig {
    /// Configuration rooted at `root`, everything else at its defaults
    pub fn with_root<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            data_dir: Some(root.into()),
            ..Default::default()
        }
    }

    /// Load configuration from file, with fallback to defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            // Create default config file
            let config = Self::default();
            config.save_to_file(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)?;
        let config: HistoryConfig = toml::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Result<PathBuf> {
        let data_dir = crate::ensure_data_dir()?;
        Ok(data_dir.join("config.toml"))
    }

    /// Load configuration from the default location
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path()?;
        Self::load_from_file(path)
    }

    /// Reject values the store cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_records_per_file == 0 {
            return Err(HistoryError::configuration(
                "max_records_per_file must be greater than zero",
            ));
        }
        if self.cache_enabled && self.cache_capacity == 0 {
            return Err(HistoryError::configuration(
                "cache_capacity must be greater than zero when caching is enabled",
            ));
        }
        Ok(())
    }

    /// Directory every history lives under
    pub fn history_root(&self) -> PathBuf {
        match &self.data_dir {
            Some(dir) => dir.clone(),
            None => crate::default_data_dir().join(DATA_DIRECTORY),
        }
    }
}

// Helper functions for default values
fn default_cache_capacity() -> usize {
    64
}

fn default_max_records_per_file() -> usize {
    150
}
