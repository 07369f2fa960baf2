//! Bounded pool for listener and caller callbacks
//!
//! Callbacks run on the blocking pool behind a semaphore, so a slow protocol
//! adapter can neither stall queue I/O tasks nor timers.

use devgate_common::{Result, TransportError};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::warn;

#[derive(Clone)]
pub struct CallbackExecutor {
    permits: Arc<Semaphore>,
    handle: Handle,
}

impl CallbackExecutor {
    /// Create an executor bound to the current runtime
    pub fn new(pool_size: usize) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| TransportError::Configuration {
            message: format!("callback executor needs a tokio runtime: {}", e),
        })?;
        Ok(Self::with_handle(pool_size, handle))
    }

    pub fn with_handle(pool_size: usize, handle: Handle) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            handle,
        }
    }

    /// Run `task` on the pool; never blocks the caller
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let permits = self.permits.clone();
        self.handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = tokio::task::spawn_blocking(task).await {
                warn!(error = %e, "Callback panicked");
            }
        });
    }

    /// Runtime the executor spawns onto
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Permits currently free
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
