//! One-shot readiness signals.
//!
//! A `Readiness<T>` wraps a setup future that runs exactly once in the
//! background. Any number of consumers can clone the handle and `wait()` on
//! it, repeatedly, without re-running the work; success and failure are both
//! broadcast to every waiter.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::error::{PluginError, Result};

type SharedResult<T> = std::result::Result<T, Arc<PluginError>>;

#[derive(Clone)]
pub struct Readiness<T: Clone> {
    inner: Shared<BoxFuture<'static, SharedResult<T>>>,
}

impl<T> Readiness<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start `work` on the runtime immediately. Must be called inside a tokio runtime.
    pub fn spawn<F>(work: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let inner = work.map(|r| r.map_err(Arc::new)).boxed().shared();
        tokio::spawn(inner.clone());
        Self { inner }
    }

    /// An already-resolved signal.
    pub fn ready(value: T) -> Self {
        let inner = futures_util::future::ready(Ok(value)).boxed().shared();
        Self { inner }
    }

    /// An already-failed signal.
    pub fn failed(err: PluginError) -> Self {
        let inner = futures_util::future::ready(Err(Arc::new(err))).boxed().shared();
        Self { inner }
    }

    /// Wait for the setup work to finish. Failures surface as `PluginError::Setup`.
    pub async fn wait(&self) -> Result<T> {
        self.inner.clone().await.map_err(PluginError::Setup)
    }

    /// The result if the work has already finished.
    pub fn peek(&self) -> Option<Result<T>> {
        self.inner
            .peek()
            .map(|r| r.clone().map_err(PluginError::Setup))
    }
}
