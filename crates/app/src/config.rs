use std::path::{Path, PathBuf};

use matchbook_core::MatchError;
use matchbook_engine::MatchingConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_LOG_FILTER: &str = "matchbook=info";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] MatchError),
    #[error("No data directory available; pass --database")]
    NoDataDir,
}

/// Settings file for the `matchbook` binary. Every key is optional.
///
/// ```toml
/// database_path = "/var/lib/matchbook/matchbook.db"
/// log_filter = "matchbook=debug"
///
/// [matching]
/// auto_propose_threshold = 75.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: Option<PathBuf>,
    pub log_filter: String,
    pub matching: MatchingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            matching: MatchingConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn from_toml(toml_content: &str) -> Result<Self, AppConfigError> {
        let config: AppConfig = toml::from_str(toml_content)?;
        config.matching.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, AppConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| AppConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Defaults when no file is given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, AppConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// The configured database, else `matchbook.db` in the platform data dir.
    pub fn resolve_database_path(&self) -> Result<PathBuf, AppConfigError> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => default_database_path().ok_or(AppConfigError::NoDataDir),
        }
    }
}

pub fn default_database_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("com", "matchbook", "Matchbook")
        .map(|dirs| dirs.data_dir().join("matchbook.db"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.log_filter, "matchbook=info");
    }

    #[test]
    fn matching_section_overrides_defaults() {
        let config = AppConfig::from_toml(
            r#"
            database_path = "/tmp/mb.db"

            [matching]
            auto_propose_threshold = 80.0
            suppress_rejected_pairs = false
            "#,
        )
        .unwrap();
        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/mb.db")));
        assert_eq!(config.matching.auto_propose_threshold, 80.0);
        assert!(!config.matching.suppress_rejected_pairs);
        assert_eq!(config.matching.date_window_days, 3);
        assert_eq!(
            config.resolve_database_path().unwrap(),
            PathBuf::from("/tmp/mb.db")
        );
    }

    #[test]
    fn invalid_weights_are_rejected() {
        let err = AppConfig::from_toml(
            r#"
            [matching.weights]
            amount = 0.9
            date = 0.9
            vendor = 0.9
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, AppConfigError::Invalid(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "log_filter = \"matchbook=debug\"").unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.log_filter, "matchbook=debug");

        let missing = AppConfig::load(Path::new("/nonexistent/matchbook.toml")).unwrap_err();
        assert!(matches!(missing, AppConfigError::Read { .. }));
    }
}
