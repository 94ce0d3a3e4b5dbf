use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{Error, Result};

/// Whether restored, discarded tabs may load their favicon
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaviconMode {
    #[default]
    Skip,
    Load,
}

/// User options consulted by the group engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Pinned tabs are neither saved nor closed by a switch
    pub exclude_pinned_tabs: bool,
    /// Restore inactive tabs without loading them
    pub discard_inactive_tabs: bool,
    pub discard_inactive_tabs_favicon: FaviconMode,
    /// Give new groups a random color
    pub auto_set_color: bool,
    /// Overridden new-tab page, treated like `about:newtab`
    pub new_tab_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            exclude_pinned_tabs: false,
            discard_inactive_tabs: true,
            discard_inactive_tabs_favicon: FaviconMode::Skip,
            auto_set_color: false,
            new_tab_url: None,
        }
    }
}

impl Settings {
    /// Whether inactive restored tabs should open through the redirector
    pub fn defer_favicons(&self) -> bool {
        self.discard_inactive_tabs && self.discard_inactive_tabs_favicon == FaviconMode::Skip
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    settings: Settings,
}

impl ConfigFile {
    /// Default data directory (`~/.tab-groups`)
    pub fn data_dir() -> Result<PathBuf> {
        let home =
            dirs::home_dir().ok_or_else(|| Error::config("Cannot determine home directory"))?;
        Ok(home.join(".tab-groups"))
    }

    /// Read `config.json` from `dir`; `None` when there is no file
    pub async fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join("config.json");
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(_) => return Ok(None),
        };
        let cfg = serde_json::from_str::<Self>(&content)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        Ok(Some(cfg))
    }

    pub async fn load_settings(dir: &Path) -> Result<Settings> {
        Ok(Self::load(dir).await?.map(|c| c.settings).unwrap_or_default())
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        assert!(ConfigFile::load(dir.path()).await.unwrap().is_none());
        let settings = ConfigFile::load_settings(dir.path()).await.unwrap();
        assert_eq!(settings, Settings::default());
        assert!(settings.defer_favicons());
    }

    #[tokio::test]
    async fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{ "settings": { "exclude_pinned_tabs": true, "discard_inactive_tabs_favicon": "load" } }"#,
        )
        .await
        .unwrap();

        let settings = ConfigFile::load_settings(dir.path()).await.unwrap();
        assert!(settings.exclude_pinned_tabs);
        assert!(settings.discard_inactive_tabs);
        assert!(!settings.defer_favicons());
    }

    #[tokio::test]
    async fn test_malformed_file_is_a_config_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("config.json"), "{ nope").await.unwrap();
        let err = ConfigFile::load(dir.path()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
