//! Error taxonomy shared by every component of the plugin.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    /// No release catalog entry for this os/arch pair. Not retryable without a new build.
    #[error("unsupported platform: {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },
    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },
    #[error("extraction of {} failed: {reason}", path.display())]
    Extraction { path: PathBuf, reason: String },
    #[error("script evaluation is not supported")]
    EvalUnsupported,
    #[error("theme download from {url} failed: {source}")]
    ThemeDownload {
        url: String,
        #[source]
        source: Box<PluginError>,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("terminal error: {0}")]
    Terminal(String),
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("unknown setting: {0}")]
    UnknownSetting(String),
    #[error("setting {0} is read-only")]
    ReadOnlySetting(String),
    #[error("invalid value for setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },
    /// A readiness signal this operation depends on resolved with an error.
    #[error("setup failed: {0}")]
    Setup(Arc<PluginError>),
}

impl PluginError {
    pub(crate) fn download(url: &str, reason: impl ToString) -> Self {
        Self::Download {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn extraction(path: &std::path::Path, reason: impl ToString) -> Self {
        Self::Extraction {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PluginError>;
