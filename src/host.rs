//! Collaborators supplied by whatever hosts the plugin.
//!
//! The plugin never reaches into a global registry: the host hands it a
//! `Host` for lifecycle requests and change notifications, and a
//! `DeviceLookup` for resolving sibling devices by name.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::bridge::TerminalService;
use crate::error::{PluginError, Result};

/// Capabilities whose state observers may want to refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// The editable btop.conf source.
    Scriptable,
    /// Human-readable documentation.
    Readme,
    Settings,
}

pub trait Host: Send + Sync {
    /// Ask for the whole plugin process to be restarted.
    fn request_restart(&self);

    /// Tell observers that `capability` changed.
    fn notify_changed(&self, capability: Capability);
}

pub trait DeviceLookup: Send + Sync {
    /// Resolve a terminal service device by name.
    fn terminal_service(&self, name: &str) -> Result<Arc<dyn TerminalService>>;
}

/// Host used by the standalone binary: restart requests are recorded and
/// wake anyone waiting in `restart_requested()`.
#[derive(Default)]
pub struct LocalHost {
    restarts: AtomicUsize,
    restart_notify: Notify,
}

impl LocalHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Resolves once a restart has been requested (immediately if one already was).
    pub async fn restart_requested(&self) {
        let notified = self.restart_notify.notified();
        if self.restart_count() > 0 {
            return;
        }
        notified.await;
    }
}

impl Host for LocalHost {
    fn request_restart(&self) {
        let n = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::warn!(requests = n, "plugin restart requested");
        self.restart_notify.notify_waiters();
    }

    fn notify_changed(&self, capability: Capability) {
        tracing::debug!(?capability, "capability changed");
    }
}

/// Name → terminal service table.
#[derive(Default)]
pub struct DeviceRegistry {
    terminals: RwLock<HashMap<String, Arc<dyn TerminalService>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_terminal(&self, name: &str, service: Arc<dyn TerminalService>) {
        self.terminals.write().insert(name.to_string(), service);
    }
}

impl DeviceLookup for DeviceRegistry {
    fn terminal_service(&self, name: &str) -> Result<Arc<dyn TerminalService>> {
        self.terminals
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::DeviceNotFound(name.to_string()))
    }
}

/// Host double that records every call.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingHost {
    pub(crate) restarts: AtomicUsize,
    pub(crate) changes: parking_lot::Mutex<Vec<Capability>>,
}

#[cfg(test)]
impl RecordingHost {
    pub(crate) fn restart_count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub(crate) fn changed(&self, capability: Capability) -> usize {
        self.changes.lock().iter().filter(|c| **c == capability).count()
    }
}

#[cfg(test)]
impl Host for RecordingHost {
    fn request_restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }

    fn notify_changed(&self, capability: Capability) {
        self.changes.lock().push(capability);
    }
}
