//! Theme manager: downloads user-listed theme files into btop's theme directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, Result};
use crate::fetch;
use crate::host::{Capability, Host};
use crate::install::InstallRecord;
use crate::paths::BtopPaths;
use crate::platform::Platform;
use crate::readiness::Readiness;
use crate::store::{keys, SettingsStore};

/// What to do when one URL in the theme list fails to download.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThemeFailurePolicy {
    /// Stop at the first failure; later URLs are not attempted.
    #[default]
    Abort,
    /// Log the failure and carry on with the rest of the list.
    SkipFailed,
}

pub struct ThemeManager {
    store: Arc<dyn SettingsStore>,
    host: Arc<dyn Host>,
    client: reqwest::Client,
    platform: Platform,
    home_dir: PathBuf,
    download_dir: PathBuf,
    install: Readiness<InstallRecord>,
    policy: ThemeFailurePolicy,
}

impl ThemeManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SettingsStore>,
        host: Arc<dyn Host>,
        client: reqwest::Client,
        platform: Platform,
        home_dir: impl Into<PathBuf>,
        cache_root: &Path,
        install: Readiness<InstallRecord>,
        policy: ThemeFailurePolicy,
    ) -> Self {
        Self {
            store,
            host,
            client,
            platform,
            home_dir: home_dir.into(),
            download_dir: cache_root.join("themes"),
            install,
            policy,
        }
    }

    /// The persisted theme URL list. An unparsable value reads as empty.
    pub fn theme_urls(&self) -> Vec<String> {
        let Some(raw) = self.store.get(keys::THEME_URLS) else {
            return Vec::new();
        };
        match serde_json::from_str(&raw) {
            Ok(urls) => urls,
            Err(e) => {
                tracing::warn!("stored theme list is not a JSON string array, ignoring: {e}");
                Vec::new()
            }
        }
    }

    /// Replace the URL list. Themes are only read when btop starts, so this
    /// asks for a restart.
    pub fn put_setting(&self, urls: Vec<String>) -> Result<()> {
        self.store.set(keys::THEME_URLS, &serde_json::to_string(&urls)?)?;
        tracing::info!(count = urls.len(), "theme list updated");
        self.host.notify_changed(Capability::Settings);
        self.host.request_restart();
        Ok(())
    }

    /// Make sure the theme directory exists and holds every listed theme.
    /// Returns how many themes were downloaded.
    pub async fn reconcile(&self) -> Result<usize> {
        let record = self.install.wait().await?;
        let paths = BtopPaths::resolve(&self.platform, &self.home_dir, &record.executable);

        let created = !paths.theme_dir.exists();
        fs::create_dir_all(&paths.theme_dir)?;
        if created && let Some(bundled) = &paths.bundled_theme_dir {
            preseed(bundled, &paths.theme_dir);
        }

        let mut installed = 0;
        for url in self.theme_urls() {
            match self.install_theme(&url, &paths.theme_dir).await {
                Ok(target) => {
                    tracing::info!(url, path = %target.display(), "theme installed");
                    installed += 1;
                }
                Err(e) => match self.policy {
                    ThemeFailurePolicy::Abort => {
                        tracing::error!(url, "theme download failed, skipping remaining themes: {e}");
                        return Err(PluginError::ThemeDownload {
                            url,
                            source: Box::new(e),
                        });
                    }
                    ThemeFailurePolicy::SkipFailed => {
                        tracing::warn!(url, "theme download failed, continuing: {e}");
                    }
                },
            }
        }
        Ok(installed)
    }

    async fn install_theme(&self, url: &str, theme_dir: &Path) -> Result<PathBuf> {
        let name = theme_file_name(url)?;
        let temp = self.download_dir.join(format!("{name}.download"));
        fetch::download_to_file(&self.client, url, &temp, |_, _| {}).await?;

        let target = theme_dir.join(&name);
        let copied = fs::copy(&temp, &target);
        let _ = fs::remove_file(&temp);
        copied?;
        Ok(target)
    }
}

/// Run the first theme pass in the background.
pub fn spawn_reconcile(manager: Arc<ThemeManager>) -> Readiness<()> {
    Readiness::spawn(async move { manager.reconcile().await.map(|_| ()) })
}

/// File name for a theme downloaded from `url`: the last path segment.
pub(crate) fn theme_file_name(url: &str) -> Result<String> {
    let parsed = url::Url::parse(url).map_err(|e| PluginError::download(url, e))?;
    parsed
        .path_segments()
        .and_then(|segments| segments.last())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| PluginError::download(url, "URL has no file name"))
}

/// Copy themes shipped with the release into a freshly created theme directory.
/// Failures only cost the user the bundled themes, so they are logged and skipped.
fn preseed(bundled: &Path, theme_dir: &Path) {
    if bundled == theme_dir {
        return;
    }
    let entries = match fs::read_dir(bundled) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %bundled.display(), "no bundled themes: {e}");
            return;
        }
    };
    for entry in entries.flatten() {
        let source = entry.path();
        if !source.is_file() {
            continue;
        }
        if let Err(e) = fs::copy(&source, theme_dir.join(entry.file_name())) {
            tracing::warn!(theme = %source.display(), "could not copy bundled theme: {e}");
        }
    }
}
