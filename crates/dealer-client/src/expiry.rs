//! One-shot "session expired" notification
//!
//! Armed whenever credentials are installed or refreshed. Firing disarms it,
//! so concurrent failures of the same session notify subscribers once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::info;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Notifier fired when the session can no longer be recovered.
pub struct AuthExpiryNotifier {
    armed: AtomicBool,
    callbacks: RwLock<Vec<Callback>>,
}

impl AuthExpiryNotifier {
    pub fn new(armed: bool) -> Self {
        Self {
            armed: AtomicBool::new(armed),
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Disarm without notifying (explicit logout).
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Notify subscribers if armed. Returns whether this call fired.
    pub fn fire(&self) -> bool {
        if !self.armed.swap(false, Ordering::SeqCst) {
            return false;
        }
        info!("session expired, notifying subscribers");
        let callbacks = self.callbacks.read().clone();
        for callback in callbacks {
            callback();
        }
        true
    }

    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.write().push(Arc::new(callback));
    }
}

impl std::fmt::Debug for AuthExpiryNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthExpiryNotifier")
            .field("armed", &self.is_armed())
            .field("subscribers", &self.callbacks.read().len())
            .finish()
    }
}
