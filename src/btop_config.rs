//! Keeps btop.conf on disk in line with the persisted copy.
//!
//! The persisted value is authoritative once it exists; until then it is
//! seeded from whatever is on disk (or the bundled default).

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;

use crate::catalog::BTOP_VERSION;
use crate::error::{PluginError, Result};
use crate::host::{Capability, Host};
use crate::install::{escalate_failure, InstallRecord};
use crate::paths::{BtopPaths, CONFIG_FILE_NAME};
use crate::platform::Platform;
use crate::readiness::Readiness;
use crate::store::{keys, SettingsStore};

/// Written when no btop.conf exists yet.
pub const DEFAULT_CONFIG: &str = include_str!("../assets/btop.conf");

/// An editable script as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptSource {
    pub name: String,
    pub script: String,
    pub language: String,
}

#[derive(Default)]
struct Snapshot {
    config_file: Option<PathBuf>,
    themes: Vec<String>,
}

pub struct ConfigReconciler {
    store: Arc<dyn SettingsStore>,
    host: Arc<dyn Host>,
    platform: Platform,
    home_dir: PathBuf,
    install: Readiness<InstallRecord>,
    themes_ready: Readiness<()>,
    snapshot: RwLock<Snapshot>,
}

impl ConfigReconciler {
    pub fn new(
        store: Arc<dyn SettingsStore>,
        host: Arc<dyn Host>,
        platform: Platform,
        home_dir: impl Into<PathBuf>,
        install: Readiness<InstallRecord>,
        themes_ready: Readiness<()>,
    ) -> Self {
        Self {
            store,
            host,
            platform,
            home_dir: home_dir.into(),
            install,
            themes_ready,
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    async fn paths(&self) -> Result<BtopPaths> {
        let record = self.install.wait().await?;
        Ok(BtopPaths::resolve(&self.platform, &self.home_dir, &record.executable))
    }

    /// Bring btop.conf and the persisted value into agreement, then refresh
    /// the theme listing.
    pub async fn reconcile(&self) -> Result<()> {
        let paths = self.paths().await?;
        // Theme downloads are best-effort; only wait for them to settle
        if let Err(e) = self.themes_ready.wait().await {
            tracing::warn!("theme setup failed, continuing with what is on disk: {e}");
        }

        let on_disk = ensure_config_file(&paths.config_file)?;
        match self.store.get(keys::CONFIG).filter(|v| !v.is_empty()) {
            Some(persisted) if persisted != on_disk => {
                tracing::info!(path = %paths.config_file.display(), "restoring saved btop config");
                fs::write(&paths.config_file, persisted)?;
            }
            Some(_) => tracing::debug!("btop config already matches saved copy"),
            None => {
                tracing::info!(path = %paths.config_file.display(), "seeding saved btop config from disk");
                self.store.set(keys::CONFIG, &on_disk)?;
            }
        }

        let themes = enumerate_themes(&paths.theme_search_dirs);
        tracing::info!(count = themes.len(), "themes available");
        {
            let mut snapshot = self.snapshot.write();
            snapshot.config_file = Some(paths.config_file);
            snapshot.themes = themes;
        }

        self.host.notify_changed(Capability::Scriptable);
        self.host.notify_changed(Capability::Readme);
        Ok(())
    }

    /// Persist `contents` as the config. If that changes the file on disk, the
    /// file is rewritten (or removed when `contents` is empty) and btop has to
    /// be restarted to see it.
    pub async fn save_script(&self, contents: &str) -> Result<()> {
        self.store.set(keys::CONFIG, contents)?;
        self.host.notify_changed(Capability::Scriptable);

        let paths = self.paths().await?;
        let on_disk = match fs::read_to_string(&paths.config_file) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        if on_disk == contents {
            return Ok(());
        }

        if contents.is_empty() {
            tracing::info!(path = %paths.config_file.display(), "removing btop config");
            match fs::remove_file(&paths.config_file) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            if let Some(parent) = paths.config_file.parent() {
                fs::create_dir_all(parent)?;
            }
            tracing::info!(path = %paths.config_file.display(), "writing btop config");
            fs::write(&paths.config_file, contents)?;
        }
        self.host.request_restart();
        Ok(())
    }

    /// The saved config, keyed by file name.
    pub fn load_scripts(&self) -> BTreeMap<String, ScriptSource> {
        let script = self.store.get(keys::CONFIG).unwrap_or_default();
        BTreeMap::from([(
            CONFIG_FILE_NAME.to_string(),
            ScriptSource {
                name: CONFIG_FILE_NAME.to_string(),
                script,
                language: "ini".to_string(),
            },
        )])
    }

    pub fn eval(&self, _source: &str) -> Result<()> {
        Err(PluginError::EvalUnsupported)
    }

    /// Theme names found by the last reconciliation.
    pub fn available_themes(&self) -> Vec<String> {
        self.snapshot.read().themes.clone()
    }

    pub fn readme(&self) -> String {
        let snapshot = self.snapshot.read();
        let mut out = format!(
            "# btop\n\n\
             Resource monitor [btop](https://github.com/aristocratos/btop) {BTOP_VERSION}, \
             running in a terminal stream.\n\n\
             ## Configuration\n\n\
             Edit `{CONFIG_FILE_NAME}` from the script editor. Saving a change restarts the plugin \
             so btop picks it up.\n"
        );
        if let Some(path) = &snapshot.config_file {
            out.push_str(&format!("\nThe file lives at `{}`.\n", path.display()));
        }
        out.push_str("\n## Themes\n\n");
        if snapshot.themes.is_empty() {
            out.push_str("No themes found.\n");
        } else {
            out.push_str("Set `color_theme` to one of:\n\n");
            for theme in &snapshot.themes {
                out.push_str(&format!("- {theme}\n"));
            }
        }
        out.push_str(
            "\nMore themes can be added with the `theme_urls` setting; each URL must point \
             at a single `.theme` file.\n",
        );
        out
    }
}

/// Run the startup reconciliation in the background. Failures not caused by a
/// failed install are escalated to a restart after `backoff`.
pub fn spawn_reconcile(
    reconciler: Arc<ConfigReconciler>,
    host: Arc<dyn Host>,
    backoff: Duration,
) -> Readiness<()> {
    let ready = Readiness::spawn(async move { reconciler.reconcile().await });
    escalate_failure(ready.clone(), "btop config reconciliation", host, backoff);
    ready
}

/// Read the config file, first writing the bundled default if it is missing.
fn ensure_config_file(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            tracing::info!(path = %path.display(), "writing default btop config");
            fs::write(path, DEFAULT_CONFIG)?;
            Ok(DEFAULT_CONFIG.to_string())
        }
        Err(e) => Err(e.into()),
    }
}

/// Extension-stripped names of every file in `dirs`, sorted. Names found in
/// more than one directory are listed once per directory.
pub(crate) fn enumerate_themes(dirs: &[PathBuf]) -> Vec<String> {
    let mut themes = Vec::new();
    for dir in dirs {
        let Ok(entries) = fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(stem) = path.file_stem() {
                themes.push(stem.to_string_lossy().into_owned());
            }
        }
    }
    themes.sort();
    themes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RecordingHost;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: Arc<MemoryStore>,
        host: Arc<RecordingHost>,
        record: InstallRecord,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let install_dir = dir.path().join("cache/btop-linux-x86_64");
            let executable = install_dir.join("btop/bin/btop");
            fs::create_dir_all(executable.parent().unwrap()).unwrap();
            fs::write(&executable, "bin").unwrap();
            Self {
                store: Arc::new(MemoryStore::default()),
                host: Arc::new(RecordingHost::default()),
                record: InstallRecord {
                    install_dir,
                    executable,
                    cache_bust_token: "t".into(),
                },
                dir,
            }
        }

        fn home(&self) -> PathBuf {
            self.dir.path().join("home")
        }

        fn config_file(&self) -> PathBuf {
            self.home().join(".config/btop/btop.conf")
        }

        fn reconciler(&self) -> ConfigReconciler {
            ConfigReconciler::new(
                self.store.clone(),
                self.host.clone(),
                Platform::new("linux", "x86_64"),
                self.home(),
                Readiness::ready(self.record.clone()),
                Readiness::ready(()),
            )
        }
    }

    #[tokio::test]
    async fn missing_file_gets_default_and_seeds_store() {
        let fx = Fixture::new();
        fx.reconciler().reconcile().await.unwrap();

        assert_eq!(fs::read_to_string(fx.config_file()).unwrap(), DEFAULT_CONFIG);
        assert_eq!(fx.store.get(keys::CONFIG).as_deref(), Some(DEFAULT_CONFIG));
        assert_eq!(fx.host.restart_count(), 0);
    }

    #[tokio::test]
    async fn existing_file_seeds_store() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.config_file().parent().unwrap()).unwrap();
        fs::write(fx.config_file(), "color_theme = \"nord\"\n").unwrap();

        fx.reconciler().reconcile().await.unwrap();

        assert_eq!(fx.store.get(keys::CONFIG).as_deref(), Some("color_theme = \"nord\"\n"));
        assert_eq!(fs::read_to_string(fx.config_file()).unwrap(), "color_theme = \"nord\"\n");
    }

    #[tokio::test]
    async fn persisted_value_overwrites_disk() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.config_file().parent().unwrap()).unwrap();
        fs::write(fx.config_file(), "update_ms = 2000\n").unwrap();
        fx.store.set(keys::CONFIG, "update_ms = 500\n").unwrap();

        fx.reconciler().reconcile().await.unwrap();

        assert_eq!(fs::read_to_string(fx.config_file()).unwrap(), "update_ms = 500\n");
        assert_eq!(fx.store.get(keys::CONFIG).as_deref(), Some("update_ms = 500\n"));
    }

    #[tokio::test]
    async fn empty_persisted_value_is_reseeded() {
        let fx = Fixture::new();
        fx.store.set(keys::CONFIG, "").unwrap();
        fx.reconciler().reconcile().await.unwrap();
        assert_eq!(fx.store.get(keys::CONFIG).as_deref(), Some(DEFAULT_CONFIG));
    }

    #[tokio::test]
    async fn reconcile_notifies_script_and_readme() {
        let fx = Fixture::new();
        fx.reconciler().reconcile().await.unwrap();
        assert_eq!(fx.host.changed(Capability::Scriptable), 1);
        assert_eq!(fx.host.changed(Capability::Readme), 1);
    }

    #[tokio::test]
    async fn save_then_load_round_trips_and_restarts_once() {
        let fx = Fixture::new();
        let reconciler = fx.reconciler();
        reconciler.reconcile().await.unwrap();

        reconciler.save_script("update_ms = 1000\n").await.unwrap();

        let scripts = reconciler.load_scripts();
        let script = &scripts[CONFIG_FILE_NAME];
        assert_eq!(script.script, "update_ms = 1000\n");
        assert_eq!(script.language, "ini");
        assert_eq!(fs::read_to_string(fx.config_file()).unwrap(), "update_ms = 1000\n");
        assert_eq!(fx.host.restart_count(), 1);
    }

    #[tokio::test]
    async fn saving_unchanged_contents_does_not_restart() {
        let fx = Fixture::new();
        let reconciler = fx.reconciler();
        reconciler.reconcile().await.unwrap();

        reconciler.save_script(DEFAULT_CONFIG).await.unwrap();

        assert_eq!(fx.host.restart_count(), 0);
        assert_eq!(fx.host.changed(Capability::Scriptable), 2);
    }

    #[tokio::test]
    async fn saving_empty_deletes_the_file() {
        let fx = Fixture::new();
        let reconciler = fx.reconciler();
        reconciler.reconcile().await.unwrap();

        reconciler.save_script("").await.unwrap();

        assert!(!fx.config_file().exists());
        assert_eq!(reconciler.load_scripts()[CONFIG_FILE_NAME].script, "");
        assert_eq!(fx.host.restart_count(), 1);
    }

    #[tokio::test]
    async fn save_creates_missing_directories() {
        let fx = Fixture::new();
        fx.reconciler().save_script("x = 1\n").await.unwrap();
        assert_eq!(fs::read_to_string(fx.config_file()).unwrap(), "x = 1\n");
    }

    #[test]
    fn eval_is_unsupported() {
        let fx = Fixture::new();
        assert!(matches!(
            fx.reconciler().eval("anything"),
            Err(PluginError::EvalUnsupported)
        ));
    }

    #[test]
    fn themes_are_stripped_and_sorted() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        fs::create_dir_all(&first).unwrap();
        fs::create_dir_all(&second).unwrap();
        fs::write(first.join("a.theme"), "").unwrap();
        fs::write(first.join("c.theme"), "").unwrap();
        fs::write(second.join("b.theme"), "").unwrap();

        let themes = enumerate_themes(&[first, second, dir.path().join("missing")]);
        assert_eq!(themes, vec!["a", "b", "c"]);
    }

    #[test]
    fn duplicate_theme_names_are_kept() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("first");
        let second = dir.path().join("second");
        fs::create_dir_all(&first).unwrap();
        fs::create_dir_all(&second).unwrap();
        fs::write(first.join("nord.theme"), "").unwrap();
        fs::write(second.join("nord.theme"), "").unwrap();

        assert_eq!(enumerate_themes(&[first, second]), vec!["nord", "nord"]);
    }

    #[tokio::test]
    async fn readme_lists_discovered_themes() {
        let fx = Fixture::new();
        let bundled = fx.record.install_dir.join("btop/themes");
        fs::create_dir_all(&bundled).unwrap();
        fs::write(bundled.join("dracula.theme"), "").unwrap();
        let reconciler = fx.reconciler();
        reconciler.reconcile().await.unwrap();

        let readme = reconciler.readme();
        assert!(readme.contains("- dracula"));
        assert!(readme.contains(&fx.config_file().display().to_string()));
        assert_eq!(reconciler.available_themes(), vec!["dracula"]);
    }

    #[tokio::test]
    async fn theme_failure_does_not_block_reconcile() {
        let fx = Fixture::new();
        let reconciler = ConfigReconciler::new(
            fx.store.clone(),
            fx.host.clone(),
            Platform::new("linux", "x86_64"),
            fx.home(),
            Readiness::ready(fx.record.clone()),
            Readiness::failed(PluginError::download("https://x/t.theme", "HTTP 500")),
        );
        reconciler.reconcile().await.unwrap();
        assert!(fx.config_file().is_file());
    }

    #[tokio::test]
    async fn install_failure_fails_reconcile_without_restart() {
        let fx = Fixture::new();
        let reconciler = Arc::new(ConfigReconciler::new(
            fx.store.clone(),
            fx.host.clone(),
            Platform::new("linux", "x86_64"),
            fx.home(),
            Readiness::failed(PluginError::download("https://x", "HTTP 404")),
            Readiness::ready(()),
        ));
        let ready = spawn_reconcile(reconciler, fx.host.clone(), Duration::ZERO);
        assert!(ready.wait().await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The install supervisor owns that restart
        assert_eq!(fx.host.restart_count(), 0);
        assert!(!fx.config_file().exists());
    }

    #[tokio::test]
    async fn reconcile_waits_for_theme_pass() {
        let fx = Fixture::new();
        let theme_dir = fx.home().join(".config/btop/themes");
        let (release, gate) = tokio::sync::oneshot::channel::<()>();
        let themes_ready = Readiness::spawn(async move {
            let _ = gate.await;
            Ok(())
        });
        let reconciler = Arc::new(ConfigReconciler::new(
            fx.store.clone(),
            fx.host.clone(),
            Platform::new("linux", "x86_64"),
            fx.home(),
            Readiness::ready(fx.record.clone()),
            themes_ready,
        ));

        let task = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.reconcile().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());
        assert!(!fx.config_file().exists());
        assert!(fx.store.get(keys::CONFIG).is_none());

        // Lands while the theme pass is still running
        fs::create_dir_all(&theme_dir).unwrap();
        fs::write(theme_dir.join("late.theme"), "theme").unwrap();
        release.send(()).unwrap();

        task.await.unwrap().unwrap();
        assert!(fx.config_file().is_file());
        assert_eq!(reconciler.available_themes(), vec!["late"]);
    }
}
