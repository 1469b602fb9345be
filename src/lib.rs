pub mod bridge;
pub mod btop_config;
pub mod catalog;
pub mod config;
pub mod error;
pub mod fetch;
pub mod host;
pub mod install;
pub mod logging;
pub mod paths;
pub mod platform;
pub mod pty;
pub mod readiness;
pub mod settings;
pub mod store;
pub mod themes;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::bridge::{ByteStream, StreamBridge, TerminalOptions};
use crate::btop_config::{ConfigReconciler, ScriptSource};
use crate::catalog::{ReleaseDescriptor, CACHE_BUST_TOKEN};
use crate::install::{InstallCacheManager, InstallRecord};
use crate::readiness::Readiness;
use crate::settings::{Setting, SettingsSurface};
use crate::store::{JsonFileStore, SettingsStore};
use crate::themes::ThemeManager;

pub use crate::config::PluginConfig;
pub use crate::error::{PluginError, Result};
pub use crate::host::{Capability, DeviceLookup, DeviceRegistry, Host, LocalHost};

/// The btop plugin: provisions btop, keeps its config and themes in sync and
/// serves it as a terminal stream.
pub struct BtopPlugin {
    config: PluginConfig,
    install: Readiness<InstallRecord>,
    config_ready: Readiness<()>,
    reconciler: Arc<ConfigReconciler>,
    themes: Arc<ThemeManager>,
    settings: SettingsSurface,
    bridge: StreamBridge,
}

impl BtopPlugin {
    /// Start the plugin for the configured platform, persisting settings in
    /// `<root>/settings.json`. Fails straight away on unsupported platforms.
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: PluginConfig,
        host: Arc<dyn Host>,
        devices: Arc<dyn DeviceLookup>,
    ) -> Result<Self> {
        let descriptor = catalog::lookup(&config.platform)?;
        let store: Arc<dyn SettingsStore> = Arc::new(JsonFileStore::open(config.store_path()));
        Self::start_with(config, descriptor, store, host, devices)
    }

    /// Start from an explicit release and settings store.
    pub fn start_with(
        config: PluginConfig,
        descriptor: ReleaseDescriptor,
        store: Arc<dyn SettingsStore>,
        host: Arc<dyn Host>,
        devices: Arc<dyn DeviceLookup>,
    ) -> Result<Self> {
        tracing::info!(
            platform = %config.platform,
            root = %config.root_dir.display(),
            url = descriptor.download_url,
            "starting btop plugin"
        );
        let client = config.http_client()?;

        let manager = Arc::new(InstallCacheManager::new(
            config.cache_root(),
            config.platform.clone(),
            CACHE_BUST_TOKEN,
            client.clone(),
        ));
        let install = crate::install::spawn_install(
            manager,
            descriptor,
            host.clone(),
            config.restart_backoff,
        );

        let themes = Arc::new(ThemeManager::new(
            store.clone(),
            host.clone(),
            client,
            config.platform.clone(),
            config.home_dir.clone(),
            &config.cache_root(),
            install.clone(),
            config.theme_failure_policy,
        ));
        let themes_ready = crate::themes::spawn_reconcile(themes.clone());

        let reconciler = Arc::new(ConfigReconciler::new(
            store.clone(),
            host.clone(),
            config.platform.clone(),
            config.home_dir.clone(),
            install.clone(),
            themes_ready,
        ));
        let config_ready =
            crate::btop_config::spawn_reconcile(reconciler.clone(), host, config.restart_backoff);

        let settings = SettingsSurface::new(
            store,
            reconciler.clone(),
            themes.clone(),
            install.clone(),
            config_ready.clone(),
        );
        let bridge = StreamBridge::new(install.clone(), config_ready.clone(), devices);

        Ok(Self {
            config,
            install,
            config_ready,
            reconciler,
            themes,
            settings,
            bridge,
        })
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// The plugin is its own stream device, whatever id is asked for.
    pub fn get_device(&self, native_id: &str) -> &Self {
        tracing::debug!(native_id, "device lookup");
        self
    }

    /// Wait for install and the first config reconciliation.
    pub async fn wait_ready(&self) -> Result<InstallRecord> {
        let record = self.install.wait().await?;
        self.config_ready.wait().await?;
        Ok(record)
    }

    pub async fn install_record(&self) -> Result<InstallRecord> {
        self.install.wait().await
    }

    pub async fn get_settings(&self) -> Result<Vec<Setting>> {
        self.settings.list().await
    }

    pub async fn put_setting(&self, key: &str, value: Value) -> Result<()> {
        self.settings.put(key, value).await
    }

    pub async fn load_scripts(&self) -> Result<BTreeMap<String, ScriptSource>> {
        self.config_ready.wait().await?;
        Ok(self.reconciler.load_scripts())
    }

    pub async fn save_script(&self, contents: &str) -> Result<()> {
        self.config_ready.wait().await?;
        self.reconciler.save_script(contents).await
    }

    pub fn eval(&self, source: &str) -> Result<()> {
        self.reconciler.eval(source)
    }

    pub async fn readme(&self) -> Result<String> {
        self.config_ready.wait().await?;
        Ok(self.reconciler.readme())
    }

    pub async fn available_themes(&self) -> Result<Vec<String>> {
        self.config_ready.wait().await?;
        Ok(self.reconciler.available_themes())
    }

    pub fn theme_urls(&self) -> Vec<String> {
        self.themes.theme_urls()
    }

    /// Relay `input` to a new btop process and return its output.
    pub async fn connect_stream(
        &self,
        input: ByteStream,
        options: Option<TerminalOptions>,
    ) -> Result<ByteStream> {
        self.bridge.connect(input, options).await
    }
}

/// How a supervised session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Finished(T),
    /// A restart was requested; the process should exit so it can be relaunched.
    Restart,
}

/// Drive a one-shot `session` to completion.
///
/// A setup failure is not returned to the caller: the failing step's
/// supervisor asks `host` for a restart once the backoff has passed, and the
/// session ends with `Outcome::Restart` at that point.
pub async fn supervise<T, F>(host: &LocalHost, session: F) -> Result<Outcome<T>>
where
    F: Future<Output = Result<T>>,
{
    match session.await {
        Ok(value) => Ok(Outcome::Finished(value)),
        Err(e @ PluginError::Setup(_)) => {
            tracing::error!("btop setup failed, waiting for the scheduled restart: {e}");
            host.restart_requested().await;
            Ok(Outcome::Restart)
        }
        Err(e) => Err(e),
    }
}

/// Like `supervise`, but a restart request also cuts a running session short.
/// Used for the long-lived terminal relay.
pub async fn run<T, F>(host: &LocalHost, session: F) -> Result<Outcome<T>>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        res = supervise(host, session) => res,
        _ = host.restart_requested() => Ok(Outcome::Restart),
    }
}
