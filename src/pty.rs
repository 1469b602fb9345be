use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, PtySize};
use std::io::{Read, Write};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::bridge::{ByteStream, TerminalOptions, TerminalService};
use crate::error::{PluginError, Result};

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;
const READ_BUF_SIZE: usize = 4096;
const OUTPUT_QUEUE: usize = 64;

/// Build a CommandBuilder for `cmd` (program + args) with the terminal
/// environment btop needs to detect color and encoding support.
pub(crate) fn build_command(cmd: &[String]) -> Result<CommandBuilder> {
    let (program, args) = cmd
        .split_first()
        .ok_or_else(|| PluginError::Terminal("empty command line".to_string()))?;
    #[allow(unused_mut)]
    let mut command = CommandBuilder::new(program);
    command.args(args);
    #[cfg(not(windows))]
    {
        command.env("TERM", "xterm-256color");
        command.env("COLORTERM", "truecolor");
        if let Ok(lang) = std::env::var("LANG") {
            command.env("LANG", lang);
        } else {
            command.env("LANG", "en_US.UTF-8");
        }
    }
    Ok(command)
}

/// Terminal service backed by a local pseudo-terminal.
#[derive(Debug, Clone, Copy)]
pub struct PtyTerminalService {
    rows: u16,
    cols: u16,
}

impl Default for PtyTerminalService {
    fn default() -> Self {
        Self::new(DEFAULT_ROWS, DEFAULT_COLS)
    }
}

impl PtyTerminalService {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    fn size_for(&self, options: &TerminalOptions) -> PtySize {
        // Guard against zero-sized windows
        PtySize {
            rows: options.rows.unwrap_or(self.rows).max(1),
            cols: options.cols.unwrap_or(self.cols).max(1),
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    fn spawn(&self, input: ByteStream, options: TerminalOptions) -> Result<ByteStream> {
        let command = build_command(&options.cmd)?;
        let pair = native_pty_system()
            .openpty(self.size_for(&options))
            .map_err(|e| PluginError::Terminal(format!("failed to open PTY: {e}")))?;
        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| PluginError::Terminal(format!("failed to spawn {}: {e}", options.cmd[0])))?;
        // Only the child may hold the slave end, so reads hit EOF once it exits
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PluginError::Terminal(format!("failed to get PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PluginError::Terminal(format!("failed to get PTY writer: {e}")))?;

        tracing::info!(cmd = ?options.cmd, pid = ?child.process_id(), "terminal process started");

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(OUTPUT_QUEUE);
        spawn_reader_thread(reader, tx);
        spawn_input_pump(input, writer);

        let master = pair.master;
        let mut child = child;
        Ok(Box::pin(async_stream::stream! {
            // Keep the PTY open for as long as output is being consumed
            let _master = master;
            while let Some(chunk) = rx.recv().await {
                yield chunk;
            }
            reap(child.as_mut());
        }))
    }
}

impl TerminalService for PtyTerminalService {
    fn connect_stream(
        &self,
        input: ByteStream,
        options: TerminalOptions,
    ) -> BoxFuture<'_, Result<ByteStream>> {
        Box::pin(async move { self.spawn(input, options) })
    }
}

/// Forward PTY output to the channel until the process closes its side or
/// the consumer goes away.
fn spawn_reader_thread(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    std::thread::spawn(move || {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                // EIO once the child has exited
                Err(_) => break,
            }
        }
    });
}

/// Write every input chunk into the PTY. The writer is blocking, so each
/// write runs on the blocking pool.
fn spawn_input_pump(mut input: ByteStream, writer: Box<dyn Write + Send>) {
    let writer = Arc::new(Mutex::new(writer));
    tokio::spawn(async move {
        while let Some(chunk) = input.next().await {
            let writer = writer.clone();
            let written = tokio::task::spawn_blocking(move || {
                let mut w = writer.lock();
                w.write_all(&chunk)?;
                w.flush()
            })
            .await;
            match written {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!("terminal input closed: {e}");
                    break;
                }
                Err(e) => {
                    tracing::warn!("terminal input task failed: {e}");
                    break;
                }
            }
        }
    });
}

fn reap(child: &mut (dyn Child + Send + Sync)) {
    match child.try_wait() {
        Ok(Some(status)) => tracing::info!(?status, "terminal process exited"),
        Ok(None) => {
            tracing::info!("output closed while process still running, killing it");
            let _ = child.kill();
            let _ = child.wait();
        }
        Err(e) => tracing::warn!("could not query terminal process: {e}"),
    }
}
