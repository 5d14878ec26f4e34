use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use url::Url;

pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Display options handed to the rendering engine on every attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerOptions {
    pub show_annotation_tools: bool,
    pub show_left_hand_panel: bool,
    pub show_page_controls: bool,
    pub show_download: bool,
    pub show_print: bool,
}

impl Default for ViewerOptions {
    fn default() -> Self {
        Self {
            show_annotation_tools: true,
            show_left_hand_panel: true,
            show_page_controls: true,
            show_download: true,
            show_print: true,
        }
    }
}

/// What the navigation channel does with a request nobody is listening for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPolicy {
    #[default]
    Drop,
    /// Keep the most recent undelivered request and hand it to the next subscriber.
    LatestForLateSubscriber,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub endpoint: Url,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    pub max_documents: usize,
    pub accepted_extension: String,
    pub accepted_media_type: String,
    pub mount_point: String,
    pub viewer: ViewerOptions,
    pub channel: ChannelPolicy,
    pub download_filename: String,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            request_timeout: Duration::from_secs(300),
            max_documents: 10,
            accepted_extension: "pdf".to_string(),
            accepted_media_type: "application/pdf".to_string(),
            mount_point: "document-surface".to_string(),
            viewer: ViewerOptions::default(),
            channel: ChannelPolicy::default(),
            download_filename: "analysis_result.json".to_string(),
        }
    }
}

static DEFAULT_ENDPOINT: Lazy<Url> =
    Lazy::new(|| Url::parse("http://127.0.0.1:5000/upload").expect("valid default endpoint"));

fn default_endpoint() -> Url {
    DEFAULT_ENDPOINT.clone()
}

impl ViewerConfig {
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("failed to decode viewer config")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if it exists, falling back to defaults otherwise.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        Self::from_toml(&raw).with_context(|| format!("invalid config file {:?}", path))
    }

    pub fn default_path(dirs: &ProjectDirs) -> PathBuf {
        dirs.config_dir().join(CONFIG_FILE_NAME)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_documents == 0 {
            return Err(anyhow!("max_documents must be at least 1"));
        }
        if self.mount_point.trim().is_empty() {
            return Err(anyhow!("mount_point must not be empty"));
        }
        if self.accepted_extension.trim().is_empty() {
            return Err(anyhow!("accepted_extension must not be empty"));
        }
        Ok(())
    }

    pub fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(&self.accepted_extension))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_every_viewer_option() {
        let config = ViewerConfig::default();
        assert_eq!(config.viewer, ViewerOptions::default());
        assert!(config.viewer.show_annotation_tools);
        assert!(config.viewer.show_print);
        assert_eq!(config.max_documents, 10);
        assert_eq!(config.channel, ChannelPolicy::Drop);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let config = ViewerConfig::from_toml(
            r#"
            endpoint = "https://analysis.example.com/upload"
            request_timeout = 30
            channel = "latest_for_late_subscriber"

            [viewer]
            show_print = false
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint.host_str(), Some("analysis.example.com"));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.channel, ChannelPolicy::LatestForLateSubscriber);
        assert!(!config.viewer.show_print);
        assert!(config.viewer.show_download);
        assert_eq!(config.download_filename, "analysis_result.json");
    }

    #[test]
    fn zero_document_limit_is_rejected() {
        assert!(ViewerConfig::from_toml("max_documents = 0").is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ViewerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.mount_point, "document-surface");
    }

    #[test]
    fn extension_check_is_case_insensitive() {
        let config = ViewerConfig::default();
        assert!(config.accepts(Path::new("report.PDF")));
        assert!(config.accepts(Path::new("/tmp/a.pdf")));
        assert!(!config.accepts(Path::new("notes.txt")));
        assert!(!config.accepts(Path::new("pdf")));
    }
}
