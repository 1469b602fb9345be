//! Install cache: download + extract the pinned btop release exactly once
//! per cache-bust token, and hand out the resolved executable path.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::ReleaseDescriptor;
use crate::error::{PluginError, Result};
use crate::fetch;
use crate::host::Host;
use crate::platform::Platform;
use crate::readiness::Readiness;

/// Name of the installed artifact; install directories derive from it.
pub const ARTIFACT_NAME: &str = "btop";

/// Result of a completed install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRecord {
    pub install_dir: PathBuf,
    pub executable: PathBuf,
    pub cache_bust_token: String,
}

pub struct InstallCacheManager {
    cache_root: PathBuf,
    platform: Platform,
    token: String,
    client: reqwest::Client,
}

impl InstallCacheManager {
    pub fn new(
        cache_root: impl Into<PathBuf>,
        platform: Platform,
        token: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            cache_root: cache_root.into(),
            platform,
            token: token.into(),
            client,
        }
    }

    /// `<cache_root>/cachebust-<os>-<arch>`
    pub fn marker_path(&self) -> PathBuf {
        self.cache_root.join(format!("cachebust-{}", self.platform.key()))
    }

    /// `<cache_root>/<artifact>-<os>-<arch>`
    pub fn install_dir(&self, artifact: &str) -> PathBuf {
        self.cache_root.join(format!("{artifact}-{}", self.platform.key()))
    }

    /// True when the marker is missing or holds a different token.
    pub fn cache_bust_required(&self) -> bool {
        match fs::read_to_string(self.marker_path()) {
            Ok(contents) => contents != self.token,
            Err(_) => true,
        }
    }

    /// Make sure `artifact` is installed from `descriptor` and return where its
    /// executable lives. Downloads only when nothing usable is cached.
    pub async fn ensure_installed(
        &self,
        descriptor: &ReleaseDescriptor,
        artifact: &str,
    ) -> Result<InstallRecord> {
        fs::create_dir_all(&self.cache_root)?;
        let install_dir = self.install_dir(artifact);

        if self.cache_bust_required() && install_dir.exists() {
            tracing::info!(dir = %install_dir.display(), "cache-bust token changed, discarding install");
            if let Err(e) = fs::remove_dir_all(&install_dir) {
                tracing::warn!(dir = %install_dir.display(), "could not remove stale install: {e}");
            }
        }

        if install_dir.exists() {
            tracing::info!(dir = %install_dir.display(), "reusing cached install");
        } else {
            self.fetch_and_extract(descriptor, artifact, &install_dir).await?;
            fs::write(self.marker_path(), &self.token)?;
        }

        let executable = install_dir.join(descriptor.executable_path);
        if !executable.is_file() {
            return Err(PluginError::extraction(
                &install_dir,
                format!("executable {} missing from install", descriptor.executable_path),
            ));
        }
        mark_executable(&executable)?;

        tracing::info!(executable = %executable.display(), "btop ready");
        Ok(InstallRecord {
            install_dir,
            executable,
            cache_bust_token: self.token.clone(),
        })
    }

    async fn fetch_and_extract(
        &self,
        descriptor: &ReleaseDescriptor,
        artifact: &str,
        install_dir: &Path,
    ) -> Result<()> {
        let key = self.platform.key();
        let archive = self.cache_root.join(format!("{artifact}-{key}.download"));
        let staging = self.cache_root.join(format!("{artifact}-{key}.partial"));

        fetch::download_to_file(&self.client, descriptor.download_url, &archive, |_, _| {}).await?;

        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        let kind = descriptor.extractor;
        let (src, dest) = (archive.clone(), staging.clone());
        tokio::task::spawn_blocking(move || fetch::extract(kind, &src, &dest))
            .await
            .map_err(|e| PluginError::extraction(&archive, format!("extract task failed: {e}")))??;

        // The install dir only ever appears fully populated
        fs::rename(&staging, install_dir)?;
        let _ = fs::remove_file(&archive);
        Ok(())
    }
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Run the install once in the background and publish the outcome.
///
/// On failure the readiness signal resolves with the error right away, and
/// after `backoff` of idling a plugin restart is requested.
pub fn spawn_install(
    manager: Arc<InstallCacheManager>,
    descriptor: ReleaseDescriptor,
    host: Arc<dyn Host>,
    backoff: Duration,
) -> Readiness<InstallRecord> {
    let ready = Readiness::spawn(async move {
        manager.ensure_installed(&descriptor, ARTIFACT_NAME).await
    });

    escalate_failure(ready.clone(), "btop install", host, backoff);
    ready
}

/// Watch a setup step and, if it fails, idle for `backoff` before asking the
/// host for a restart. Failures that only propagate an upstream setup failure
/// are left to that step's own supervisor.
pub(crate) fn escalate_failure<T>(
    ready: Readiness<T>,
    stage: &'static str,
    host: Arc<dyn Host>,
    backoff: Duration,
) where
    T: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        match ready.wait().await {
            Ok(_) => {}
            Err(PluginError::Setup(inner)) if matches!(*inner, PluginError::Setup(_)) => {
                tracing::debug!(stage, "setup failed upstream: {inner}");
            }
            Err(e) => {
                tracing::error!(stage, backoff_secs = backoff.as_secs(), "setup failed, restarting after backoff: {e}");
                tokio::time::sleep(backoff).await;
                host.request_restart();
            }
        }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
