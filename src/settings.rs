//! Settings exposed to the host, including the write-once keys a legacy
//! plugin uses to hand over its config and theme list.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::btop_config::ConfigReconciler;
use crate::error::{PluginError, Result};
use crate::install::InstallRecord;
use crate::readiness::Readiness;
use crate::store::{keys, SettingsStore};
use crate::themes::ThemeManager;

pub mod setting_keys {
    pub const EXECUTABLE: &str = "executable";
    pub const THEME_URLS: &str = "theme_urls";
    pub const LEGACY_CONFIG: &str = "legacy_config";
    pub const LEGACY_THEMES: &str = "legacy_themes";
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Setting {
    pub key: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub value: Value,
    pub readonly: bool,
    pub multiple: bool,
}

pub struct SettingsSurface {
    store: Arc<dyn SettingsStore>,
    reconciler: Arc<ConfigReconciler>,
    themes: Arc<ThemeManager>,
    install: Readiness<InstallRecord>,
    config_ready: Readiness<()>,
}

impl SettingsSurface {
    pub fn new(
        store: Arc<dyn SettingsStore>,
        reconciler: Arc<ConfigReconciler>,
        themes: Arc<ThemeManager>,
        install: Readiness<InstallRecord>,
        config_ready: Readiness<()>,
    ) -> Self {
        Self {
            store,
            reconciler,
            themes,
            install,
            config_ready,
        }
    }

    /// Current settings. Waits for install and config reconciliation so the
    /// executable path is always final.
    pub async fn list(&self) -> Result<Vec<Setting>> {
        let record = self.install.wait().await?;
        self.config_ready.wait().await?;

        Ok(vec![
            Setting {
                key: setting_keys::EXECUTABLE.to_string(),
                title: "btop Executable".to_string(),
                description: Some("Path to the installed btop binary.".to_string()),
                value: Value::String(record.executable.to_string_lossy().into_owned()),
                readonly: true,
                multiple: false,
            },
            Setting {
                key: setting_keys::THEME_URLS.to_string(),
                title: "Theme URLs".to_string(),
                description: Some(
                    "Theme files to download into btop's theme directory. Changing this restarts the plugin."
                        .to_string(),
                ),
                value: Value::from(self.themes.theme_urls()),
                readonly: false,
                multiple: true,
            },
        ])
    }

    pub async fn put(&self, key: &str, value: Value) -> Result<()> {
        match key {
            setting_keys::EXECUTABLE => Err(PluginError::ReadOnlySetting(key.to_string())),
            setting_keys::THEME_URLS => self.themes.put_setting(string_list(key, value)?),
            setting_keys::LEGACY_CONFIG => {
                if self.store.get_flag(keys::LEGACY_CONFIG_MIGRATED) {
                    tracing::info!("legacy config already migrated, ignoring");
                    return Ok(());
                }
                let contents = match value {
                    Value::String(s) => s,
                    Value::Null => String::new(),
                    other => {
                        return Err(PluginError::InvalidSetting {
                            key: key.to_string(),
                            reason: format!("expected a string, got {other}"),
                        });
                    }
                };
                self.config_ready.wait().await?;
                self.reconciler.save_script(&contents).await?;
                self.store.set_flag(keys::LEGACY_CONFIG_MIGRATED, true)?;
                tracing::info!("legacy config migrated");
                Ok(())
            }
            setting_keys::LEGACY_THEMES => {
                if self.store.get_flag(keys::LEGACY_THEMES_MIGRATED) {
                    tracing::info!("legacy themes already migrated, ignoring");
                    return Ok(());
                }
                let urls = string_list(key, value)?;
                self.themes.put_setting(urls)?;
                self.store.set_flag(keys::LEGACY_THEMES_MIGRATED, true)?;
                tracing::info!("legacy themes migrated");
                Ok(())
            }
            _ => Err(PluginError::UnknownSetting(key.to_string())),
        }
    }
}

/// Accepts a JSON array of strings, a string holding such an array, a
/// single URL string, or null (empty list).
fn string_list(key: &str, value: Value) -> Result<Vec<String>> {
    let invalid = |reason: String| PluginError::InvalidSetting {
        key: key.to_string(),
        reason,
    };
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(invalid(format!("expected strings, got {other}"))),
            })
            .collect(),
        Value::String(s) if s.trim_start().starts_with('[') => {
            serde_json::from_str(&s).map_err(|e| invalid(e.to_string()))
        }
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s.trim().to_string()]),
        other => Err(invalid(format!("expected a list of strings, got {other}"))),
    }
}
