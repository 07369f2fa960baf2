//! Completion callbacks handed to the service by protocol adapters

use devgate_common::data::{DeviceInfo, DeviceProfile};
use devgate_common::{Result, TransportError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

/// Outcome of one service call; exactly one method is invoked
pub trait TransportServiceCallback<T>: Send + Sync + 'static {
    fn on_success(&self, result: T);

    fn on_error(&self, error: TransportError);
}

pub type ServiceCallback<T> = Arc<dyn TransportServiceCallback<T>>;

/// Device identity resolved from credentials
#[derive(Debug, Clone, Default)]
pub struct ValidateDeviceCredentialsResult {
    pub device_info: Option<DeviceInfo>,
    pub device_profile: Option<Arc<DeviceProfile>>,
    pub credentials: Option<String>,
}

/// Device created or found on behalf of a gateway
#[derive(Debug, Clone, Default)]
pub struct GetOrCreateDeviceResult {
    pub device_info: Option<DeviceInfo>,
    pub device_profile: Option<Arc<DeviceProfile>>,
}

/// Ignores the outcome
pub struct NoopCallback;

impl<T: 'static> TransportServiceCallback<T> for NoopCallback {
    fn on_success(&self, _result: T) {}

    fn on_error(&self, _error: TransportError) {}
}

/// Delivers the outcome through a oneshot channel, for async callers
pub struct ResultCallback<T> {
    tx: Mutex<Option<oneshot::Sender<Result<T>>>>,
}

impl<T: Send + 'static> ResultCallback<T> {
    pub fn channel() -> (ServiceCallback<T>, oneshot::Receiver<Result<T>>) {
        let (tx, rx) = oneshot::channel();
        let callback = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
        });
        (callback, rx)
    }

    fn complete(&self, result: Result<T>) {
        if let Some(tx) = self.tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(result);
        }
    }
}

impl<T: Send + 'static> TransportServiceCallback<T> for ResultCallback<T> {
    fn on_success(&self, result: T) {
        self.complete(Ok(result));
    }

    fn on_error(&self, error: TransportError) {
        self.complete(Err(error));
    }
}

/// Count-down latch over the sub-messages of one request
///
/// The delegate succeeds once every part succeeded, or fails once with the
/// first error.
pub struct BatchCallback {
    remaining: AtomicUsize,
    failed: AtomicBool,
    delegate: ServiceCallback<()>,
}

impl BatchCallback {
    pub fn new(parts: usize, delegate: ServiceCallback<()>) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(parts),
            failed: AtomicBool::new(false),
            delegate,
        })
    }
}

impl TransportServiceCallback<()> for BatchCallback {
    fn on_success(&self, _result: ()) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 && !self.failed.load(Ordering::Acquire) {
            self.delegate.on_success(());
        }
    }

    fn on_error(&self, error: TransportError) {
        if !self.failed.swap(true, Ordering::AcqRel) {
            self.delegate.on_error(error);
        }
    }
}
