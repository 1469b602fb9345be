use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PluginError, Result};
use crate::platform::Platform;
use crate::themes::ThemeFailurePolicy;

/// Environment variable naming the directory that holds all plugin state.
pub const ROOT_ENV_VAR: &str = "BTOP_PLUGIN_VOLUME";

/// Optional overrides file inside the root directory.
pub const OVERRIDES_FILE: &str = "plugin.json";

/// Idle period after a failed install before the plugin may be restarted.
pub const DEFAULT_RESTART_BACKOFF_SECS: u64 = 60 * 60;

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 120;

/// Fallback state directory when `BTOP_PLUGIN_VOLUME` is unset.
///
/// - Linux: `~/.local/share/btop-plugin/`
/// - macOS: `~/Library/Application Support/btop-plugin/`
/// - Windows: `%LOCALAPPDATA%/btop-plugin/`
///
/// Falls back to `~/.btop-plugin/` if the platform dir is unavailable.
fn default_root_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("btop-plugin"))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".btop-plugin")
        })
}

/// Load a JSON file, returning Default if missing or corrupt.
/// Logs when the file exists but cannot be read or parsed, so a corrupt
/// file shows up in logs instead of silently resetting state.
pub(crate) fn load_json_file<T: DeserializeOwned + Default>(path: &Path) -> T {
    if !path.exists() {
        return T::default();
    }
    let content = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(path = %path.display(), "could not read JSON file: {e}");
            return T::default();
        }
    };
    match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(path = %path.display(), "corrupt JSON file, using defaults: {e}");
            T::default()
        }
    }
}

/// Save a JSON file atomically (temp file + rename).
/// Sets 0600 permissions on Unix.
pub(crate) fn save_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| PluginError::Io(std::io::Error::other("JSON path has no parent")))?;
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(value)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = dir.join(format!("{file_name}.tmp.{}", std::process::id()));

    std::fs::write(&temp, &json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&temp, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&temp, path).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        PluginError::Io(e)
    })?;

    Ok(())
}

/// Fields of `plugin.json`. Everything is optional; absent keys keep the defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct PluginOverrides {
    #[serde(default)]
    pub(crate) home_dir: Option<PathBuf>,
    #[serde(default)]
    pub(crate) platform: Option<Platform>,
    #[serde(default)]
    pub(crate) restart_backoff_secs: Option<u64>,
    #[serde(default)]
    pub(crate) connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub(crate) read_timeout_secs: Option<u64>,
    #[serde(default)]
    pub(crate) theme_failure_policy: Option<ThemeFailurePolicy>,
}

/// Runtime configuration of the plugin.
#[derive(Clone, Debug)]
pub struct PluginConfig {
    /// Holds the install cache and the settings store.
    pub root_dir: PathBuf,
    /// Base for btop's own config and user themes on non-Windows platforms.
    pub home_dir: PathBuf,
    pub platform: Platform,
    pub restart_backoff: Duration,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub theme_failure_policy: ThemeFailurePolicy,
}

impl PluginConfig {
    pub fn new(root_dir: impl Into<PathBuf>, home_dir: impl Into<PathBuf>, platform: Platform) -> Self {
        Self {
            root_dir: root_dir.into(),
            home_dir: home_dir.into(),
            platform,
            restart_backoff: Duration::from_secs(DEFAULT_RESTART_BACKOFF_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS),
            theme_failure_policy: ThemeFailurePolicy::default(),
        }
    }

    /// Resolve the configuration from the process environment, then apply
    /// `<root>/plugin.json` if present. `root_override` wins over the environment.
    pub fn from_env(root_override: Option<PathBuf>) -> Self {
        let root_dir = root_override
            .or_else(|| {
                std::env::var(ROOT_ENV_VAR)
                    .ok()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .map(PathBuf::from)
            })
            .unwrap_or_else(default_root_dir);
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        let mut config = Self::new(root_dir, home_dir, Platform::current());
        let overrides: PluginOverrides = load_json_file(&config.root_dir.join(OVERRIDES_FILE));
        config.apply(overrides);
        config
    }

    pub(crate) fn apply(&mut self, overrides: PluginOverrides) {
        if let Some(home) = overrides.home_dir {
            self.home_dir = home;
        }
        if let Some(platform) = overrides.platform {
            self.platform = Platform::new(&platform.os, &platform.arch);
        }
        if let Some(secs) = overrides.restart_backoff_secs {
            self.restart_backoff = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.connect_timeout_secs {
            self.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.read_timeout_secs {
            self.read_timeout = Duration::from_secs(secs);
        }
        if let Some(policy) = overrides.theme_failure_policy {
            self.theme_failure_policy = policy;
        }
    }

    /// Root of the download/install cache.
    pub fn cache_root(&self) -> PathBuf {
        self.root_dir.join("cache")
    }

    /// Location of the persisted settings store.
    pub fn store_path(&self) -> PathBuf {
        self.root_dir.join("settings.json")
    }

    /// HTTP client shared by every download the plugin makes.
    pub(crate) fn http_client(&self) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .read_timeout(self.read_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn load_missing_file_returns_default() {
        let dir = TempDir::new().unwrap();
        let map: HashMap<String, String> = load_json_file(&dir.path().join("nope.json"));
        assert!(map.is_empty());
    }

    #[test]
    fn load_corrupt_file_returns_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        let map: HashMap<String, String> = load_json_file(&path);
        assert!(map.is_empty());
    }

    #[test]
    fn save_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("store.json");
        let mut map = HashMap::new();
        map.insert("k".to_string(), "v".to_string());
        save_json_file(&path, &map).unwrap();
        let loaded: HashMap<String, String> = load_json_file(&path);
        assert_eq!(loaded.get("k").map(String::as_str), Some("v"));
        // No temp files left behind
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        save_json_file(&path, &HashMap::<String, String>::new()).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn derived_locations_live_under_root() {
        let cfg = PluginConfig::new("/srv/plugin", "/home/u", Platform::new("linux", "x86_64"));
        assert_eq!(cfg.cache_root(), PathBuf::from("/srv/plugin/cache"));
        assert_eq!(cfg.store_path(), PathBuf::from("/srv/plugin/settings.json"));
        assert_eq!(cfg.restart_backoff, Duration::from_secs(3600));
    }

    #[test]
    fn overrides_apply_only_present_fields() {
        let mut cfg = PluginConfig::new("/r", "/h", Platform::new("linux", "x86_64"));
        let overrides: PluginOverrides =
            serde_json::from_str(r#"{"restart_backoff_secs": 5, "platform": {"os": "Windows", "arch": "AMD64"}}"#)
                .unwrap();
        cfg.apply(overrides);
        assert_eq!(cfg.restart_backoff, Duration::from_secs(5));
        assert_eq!(cfg.platform, Platform::new("windows", "x86_64"));
        assert_eq!(cfg.home_dir, PathBuf::from("/h"));
        assert_eq!(cfg.read_timeout, Duration::from_secs(DEFAULT_READ_TIMEOUT_SECS));
    }

    #[test]
    #[serial]
    fn from_env_reads_root_variable_and_overrides_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(OVERRIDES_FILE),
            r#"{"connect_timeout_secs": 7, "theme_failure_policy": "skip-failed"}"#,
        )
        .unwrap();
        // SAFETY: serialized with every other test that touches the environment.
        unsafe { std::env::set_var(ROOT_ENV_VAR, dir.path()) };
        let cfg = PluginConfig::from_env(None);
        unsafe { std::env::remove_var(ROOT_ENV_VAR) };

        assert_eq!(cfg.root_dir, dir.path());
        assert_eq!(cfg.connect_timeout, Duration::from_secs(7));
        assert_eq!(cfg.theme_failure_policy, ThemeFailurePolicy::SkipFailed);
    }

    #[test]
    #[serial]
    fn explicit_root_wins_over_environment() {
        unsafe { std::env::set_var(ROOT_ENV_VAR, "/should/not/be/used") };
        let dir = TempDir::new().unwrap();
        let cfg = PluginConfig::from_env(Some(dir.path().to_path_buf()));
        unsafe { std::env::remove_var(ROOT_ENV_VAR) };
        assert_eq!(cfg.root_dir, dir.path());
    }
}
