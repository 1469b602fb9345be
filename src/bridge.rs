//! Stream bridge: hands a caller's duplex byte stream to a terminal service
//! running the installed btop.

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::host::DeviceLookup;
use crate::install::InstallRecord;
use crate::readiness::Readiness;

/// One direction of an interactive terminal session.
pub type ByteStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Name of the device that runs commands in a terminal.
pub const TERMINAL_SERVICE_DEVICE: &str = "terminalservice";

/// btop otherwise guesses the terminal encoding from the locale.
pub const FORCE_UTF8_FLAG: &str = "--utf-force";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOptions {
    /// Program followed by its arguments.
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
}

pub trait TerminalService: Send + Sync {
    /// Run `options.cmd` in a terminal fed by `input`; resolves to the terminal's output.
    fn connect_stream(
        &self,
        input: ByteStream,
        options: TerminalOptions,
    ) -> BoxFuture<'_, Result<ByteStream>>;
}

/// Options sent to the terminal service: the fixed btop command line, keeping
/// only the caller's window size.
pub fn launch_options(executable: &Path, caller: Option<TerminalOptions>) -> TerminalOptions {
    let caller = caller.unwrap_or_default();
    TerminalOptions {
        cmd: vec![
            executable.to_string_lossy().into_owned(),
            FORCE_UTF8_FLAG.to_string(),
        ],
        rows: caller.rows,
        cols: caller.cols,
    }
}

pub struct StreamBridge {
    install: Readiness<InstallRecord>,
    config: Readiness<()>,
    devices: Arc<dyn DeviceLookup>,
}

impl StreamBridge {
    pub fn new(
        install: Readiness<InstallRecord>,
        config: Readiness<()>,
        devices: Arc<dyn DeviceLookup>,
    ) -> Self {
        Self {
            install,
            config,
            devices,
        }
    }

    /// Relay `input` to a fresh btop process. Waits until btop is installed
    /// and its config reconciled; fails if either setup step failed.
    pub async fn connect(
        &self,
        input: ByteStream,
        options: Option<TerminalOptions>,
    ) -> Result<ByteStream> {
        let record = self.install.wait().await?;
        self.config.wait().await?;

        let service = self.devices.terminal_service(TERMINAL_SERVICE_DEVICE)?;
        let options = launch_options(&record.executable, options);
        tracing::info!(cmd = ?options.cmd, "connecting terminal stream");
        service.connect_stream(input, options).await
    }
}
