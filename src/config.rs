//! Generator configuration, loaded from `dep11-config.yml`.
//!
//! The configuration is read once at startup into an immutable value that
//! is threaded through every constructor. There is no global mutable state.

use indexmap::IndexMap;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::model::IconSize;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not find configuration, make sure 'dep11-config.yml' exists in {0}")]
    NotFound(PathBuf),
    #[error("could not read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("configuration is missing required key '{0}'")]
    MissingKey(&'static str),
    #[error("invalid icon size: {0}")]
    InvalidIconSize(String),
    #[error("suite '{0}' is not configured")]
    UnknownSuite(String),
}

/// Per-suite settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SuiteConfig {
    pub components: Vec<String>,
    pub architectures: Vec<String>,
    #[serde(rename = "useIconTheme", default)]
    pub icon_theme: Option<String>,
    #[serde(rename = "dataPriority", default)]
    pub data_priority: Option<i64>,
    #[serde(rename = "baseSuite", default)]
    pub base_suite: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(rename = "ArchiveRoot")]
    archive_root: Option<PathBuf>,
    #[serde(rename = "MediaBaseUrl")]
    media_base_url: Option<String>,
    #[serde(rename = "Suites")]
    suites: Option<IndexMap<String, SuiteConfig>>,
    #[serde(rename = "CacheDir")]
    cache_dir: Option<PathBuf>,
    #[serde(rename = "ExportDir")]
    export_dir: Option<PathBuf>,
    #[serde(rename = "IconSizes")]
    icon_sizes: Option<Vec<String>>,
    #[serde(rename = "DistroName")]
    distro_name: Option<String>,
    #[serde(rename = "RepositoryName")]
    repo_name: Option<String>,
}

/// Validated generator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub archive_root: PathBuf,
    pub media_base_url: String,
    pub suites: IndexMap<String, SuiteConfig>,
    pub cache_dir: PathBuf,
    pub export_dir: PathBuf,
    pub distro_name: String,
    pub repo_name: String,
    pub icon_sizes: Vec<IconSize>,
}

impl Config {
    /// Loads and validates `dep11-config.yml` from `confdir`.
    pub fn load(confdir: &Path) -> Result<Self, ConfigError> {
        let conf_path = confdir.join("dep11-config.yml");
        if !conf_path.is_file() {
            return Err(ConfigError::NotFound(confdir.to_path_buf()));
        }
        let raw: RawConfig = serde_yaml::from_str(&std::fs::read_to_string(&conf_path)?)?;

        let archive_root = raw
            .archive_root
            .ok_or(ConfigError::MissingKey("ArchiveRoot"))?;
        let media_base_url = raw
            .media_base_url
            .ok_or(ConfigError::MissingKey("MediaBaseUrl"))?;
        let suites = raw.suites.ok_or(ConfigError::MissingKey("Suites"))?;

        let mut icon_sizes = Vec::new();
        for size in raw
            .icon_sizes
            .unwrap_or_else(|| vec!["64x64".to_string(), "128x128".to_string()])
        {
            icon_sizes.push(size.parse().map_err(ConfigError::InvalidIconSize)?);
        }

        let distro_name = raw.distro_name.unwrap_or_else(|| "Debian".to_string());
        // third-party repositories set RepositoryName to avoid clashing
        // with the main distro data
        let repo_name = raw.repo_name.unwrap_or_else(|| distro_name.clone());

        Ok(Config {
            archive_root,
            media_base_url: media_base_url.trim_end_matches('/').to_string(),
            suites,
            cache_dir: raw.cache_dir.unwrap_or_else(|| confdir.join("cache")),
            export_dir: raw.export_dir.unwrap_or_else(|| confdir.join("export")),
            distro_name,
            repo_name,
            icon_sizes,
        })
    }

    pub fn media_dir(&self) -> PathBuf {
        self.export_dir.join("media")
    }

    pub fn suite(&self, name: &str) -> Result<&SuiteConfig, ConfigError> {
        self.suites
            .get(name)
            .ok_or_else(|| ConfigError::UnknownSuite(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
ArchiveRoot: /srv/archive
MediaBaseUrl: https://metadata.example.org/media/
Suites:
  stable:
    components:
      - main
      - contrib
    architectures:
      - amd64
    useIconTheme: breeze
    dataPriority: 1
  testing:
    components:
      - main
    architectures:
      - amd64
      - arm64
    baseSuite: stable
";

    #[test]
    fn loads_a_complete_configuration() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("dep11-config.yml"), SAMPLE).unwrap();

        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.archive_root, PathBuf::from("/srv/archive"));
        assert_eq!(config.media_base_url, "https://metadata.example.org/media");
        assert_eq!(config.icon_sizes, vec![IconSize(64), IconSize(128)]);
        assert_eq!(config.distro_name, "Debian");
        assert_eq!(config.repo_name, "Debian");
        assert_eq!(config.cache_dir, dir.path().join("cache"));

        let stable = config.suite("stable").unwrap();
        assert_eq!(stable.components, vec!["main", "contrib"]);
        assert_eq!(stable.icon_theme.as_deref(), Some("breeze"));
        assert_eq!(stable.data_priority, Some(1));

        let testing = config.suite("testing").unwrap();
        assert_eq!(testing.base_suite.as_deref(), Some("stable"));
        assert!(config.suite("unstable").is_err());
    }

    #[test]
    fn missing_required_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("dep11-config.yml"),
            "ArchiveRoot: /srv/archive\n",
        )
        .unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(ConfigError::MissingKey("MediaBaseUrl"))
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(ConfigError::NotFound(_))
        ));
    }
}
