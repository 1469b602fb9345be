//! Durable key → string settings store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::config::{load_json_file, save_json_file};
use crate::error::Result;

/// Keys persisted by the plugin.
pub mod keys {
    /// btop.conf contents as last saved by the user or seeded from disk.
    pub const CONFIG: &str = "btop_config";
    /// JSON array of theme download URLs.
    pub const THEME_URLS: &str = "theme_urls";
    /// Set to "true" once the legacy config blob has been applied.
    pub const LEGACY_CONFIG_MIGRATED: &str = "legacy_config_migrated";
    /// Set to "true" once the legacy theme list has been applied.
    pub const LEGACY_THEMES_MIGRATED: &str = "legacy_themes_migrated";
}

pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Boolean-as-string flag; anything but "true" reads as false.
    fn get_flag(&self, key: &str) -> bool {
        self.get(key).as_deref() == Some("true")
    }

    fn set_flag(&self, key: &str, value: bool) -> Result<()> {
        self.set(key, if value { "true" } else { "false" })
    }
}

/// Settings persisted as a flat JSON object, rewritten atomically on every change.
pub struct JsonFileStore {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`. A corrupt file is logged and
    /// treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values: BTreeMap<String, String> = load_json_file(&path);
        tracing::debug!(path = %path.display(), entries = values.len(), "settings store opened");
        Self {
            path,
            values: RwLock::new(values),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.write();
        let previous = values.insert(key.to_string(), value.to_string());
        if let Err(e) = save_json_file(&self.path, &*values) {
            // Keep memory consistent with disk
            match previous {
                Some(old) => values.insert(key.to_string(), old),
                None => values.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }
}

/// Volatile store for tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryStore {
    values: RwLock<BTreeMap<String, String>>,
}

#[cfg(test)]
impl SettingsStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values.write().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        {
            let store = JsonFileStore::open(&path);
            store.set(keys::CONFIG, "color_theme = \"nord\"\n").unwrap();
            store.set_flag(keys::LEGACY_CONFIG_MIGRATED, true).unwrap();
        }
        let store = JsonFileStore::open(&path);
        assert_eq!(store.get(keys::CONFIG).as_deref(), Some("color_theme = \"nord\"\n"));
        assert!(store.get_flag(keys::LEGACY_CONFIG_MIGRATED));
        assert!(!store.get_flag(keys::LEGACY_THEMES_MIGRATED));
    }

    #[test]
    fn missing_key_is_none() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("settings.json"));
        assert_eq!(store.get("nothing"), None);
        assert!(!store.path().exists());
    }

    #[test]
    fn empty_string_is_a_real_value() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path().join("settings.json"));
        store.set(keys::CONFIG, "").unwrap();
        assert_eq!(store.get(keys::CONFIG).as_deref(), Some(""));
    }

    #[test]
    fn failed_write_rolls_back_memory() {
        let dir = TempDir::new().unwrap();
        // A directory where the file should be makes the rename fail
        let path = dir.path().join("settings.json");
        std::fs::create_dir_all(path.join("occupied")).unwrap();
        let store = JsonFileStore::open(&path);
        assert!(store.set("k", "v").is_err());
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn flag_only_true_is_true() {
        let store = MemoryStore::default();
        store.set("f", "yes").unwrap();
        assert!(!store.get_flag("f"));
        store.set_flag("f", true).unwrap();
        assert!(store.get_flag("f"));
    }
}
