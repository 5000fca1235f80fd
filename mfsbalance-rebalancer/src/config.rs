//! Consolidation configuration
//!
//! Priority: CLI flags > environment > config file > defaults.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

use mfsbalance_core::parse_size;

use crate::executor::{TransferCommand, DEFAULT_TRANSFER_ARGS, DEFAULT_TRANSFER_PROGRAM};
use crate::filter::DirectoryFilter;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Invalid path pattern: {0}")]
    InvalidPattern(#[from] glob::PatternError),
}

/// Settings for one consolidation run
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsolidateConfig {
    /// Skip directories with more files than this
    pub max_files: usize,

    /// Skip directories whose files add up to at least this (K/M/G/T suffixes)
    pub max_size: String,

    /// Directory must match one of these globs
    pub include: Vec<String>,

    /// Directory matching any of these globs is skipped
    pub exclude: Vec<String>,

    /// Recreate hardlink siblings next to moved files
    pub move_hardlinks: bool,

    /// Run the commands instead of only printing them
    pub execute: bool,

    /// Program used to move files between branches
    pub transfer_program: String,

    /// Arguments passed before the source and target paths
    pub transfer_args: Vec<String>,
}

impl Default for ConsolidateConfig {
    fn default() -> Self {
        Self {
            max_files: 256,
            max_size: "16G".to_string(),
            include: vec!["*".to_string()],
            exclude: Vec::new(),
            move_hardlinks: false,
            execute: false,
            transfer_program: DEFAULT_TRANSFER_PROGRAM.to_string(),
            transfer_args: DEFAULT_TRANSFER_ARGS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ConsolidateConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ConsolidateConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `MFS_CONSOLIDATE_*` environment variables
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(value) = std::env::var("MFS_CONSOLIDATE_MAX_FILES") {
            match value.parse() {
                Ok(max_files) => self.max_files = max_files,
                Err(_) => warn!(value = %value, "Ignoring invalid MFS_CONSOLIDATE_MAX_FILES"),
            }
        }

        if let Ok(value) = std::env::var("MFS_CONSOLIDATE_MAX_SIZE") {
            self.max_size = value;
        }

        if let Ok(program) = std::env::var("MFS_CONSOLIDATE_TRANSFER_PROGRAM") {
            self.transfer_program = program;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_files == 0 {
            return Err(ConfigError::InvalidValue(
                "max_files".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        self.max_size_bytes()?;
        if self.transfer_program.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "transfer_program".to_string(),
                "must not be empty".to_string(),
            ));
        }
        self.build_filter()?;
        Ok(())
    }

    pub fn max_size_bytes(&self) -> Result<u64, ConfigError> {
        parse_size(&self.max_size)
            .map_err(|e| ConfigError::InvalidValue("max_size".to_string(), e.to_string()))
    }

    /// Directory filter built from the limits and globs
    pub fn build_filter(&self) -> Result<DirectoryFilter, ConfigError> {
        Ok(DirectoryFilter::new(
            self.max_files,
            self.max_size_bytes()?,
            self.include.as_slice(),
            self.exclude.as_slice(),
        )?)
    }

    pub fn transfer_command(&self) -> TransferCommand {
        TransferCommand {
            program: self.transfer_program.clone(),
            args: self.transfer_args.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ConsolidateConfig::default();
        assert_eq!(config.max_files, 256);
        assert_eq!(config.max_size_bytes().unwrap(), 16 * 1024 * 1024 * 1024);
        assert_eq!(config.include, vec!["*"]);
        assert!(config.exclude.is_empty());
        assert!(!config.move_hardlinks);
        assert!(!config.execute);
        assert_eq!(config.transfer_program, "rsync");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
max_files = 64
max_size = "512M"
exclude = ["*/.snapshots*"]
move_hardlinks = true
"#
        )
        .unwrap();

        let config = ConsolidateConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_files, 64);
        assert_eq!(config.max_size_bytes().unwrap(), 512 * 1024 * 1024);
        assert_eq!(config.exclude, vec!["*/.snapshots*"]);
        assert!(config.move_hardlinks);
        assert_eq!(config.include, vec!["*"]);
    }

    #[test]
    fn test_from_file_rejects_bad_size() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"max_size = "lots""#).unwrap();

        let err = ConsolidateConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref field, _) if field == "max_size"));
    }

    #[test]
    fn test_validate_rejects_zero_files() {
        let config = ConsolidateConfig {
            max_files: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_glob() {
        let config = ConsolidateConfig {
            exclude: vec!["[oops".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        std::env::set_var("MFS_CONSOLIDATE_MAX_FILES", "12");
        std::env::set_var("MFS_CONSOLIDATE_MAX_SIZE", "1T");
        let config = ConsolidateConfig::default().with_env_overrides();
        std::env::remove_var("MFS_CONSOLIDATE_MAX_FILES");
        std::env::remove_var("MFS_CONSOLIDATE_MAX_SIZE");

        assert_eq!(config.max_files, 12);
        assert_eq!(config.max_size, "1T");
    }

    #[test]
    fn test_transfer_command() {
        let config = ConsolidateConfig {
            transfer_program: "/usr/local/bin/rsync".to_string(),
            ..Default::default()
        };
        let command = config.transfer_command();
        assert_eq!(command.program, "/usr/local/bin/rsync");
        assert_eq!(command.args, TransferCommand::default().args);
    }
}
