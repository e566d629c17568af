//! Single-flight token refresh
//!
//! At most one refresh exchange runs per client. The first caller that needs
//! a refresh creates the ticket and starts the exchange on a detached task;
//! everyone arriving while the ticket is open joins it as a waiter and gets
//! the same outcome, in arrival order. Checking for and creating the ticket
//! happen under one lock, so two callers can never both start an exchange.
//!
//! The exchange runs on its own task: a waiter that is cancelled or times
//! out just drops its receiver, and the refresh still completes and updates
//! the store for everyone else.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::Secret;
use dealer_auth::{CredentialPair, CredentialStore, now_millis};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use transport::Transport;

use crate::expiry::AuthExpiryNotifier;
use crate::metrics;

/// Why a refresh was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// Expiry estimate is inside the skew window
    Proactive,
    /// The server rejected the access token
    Reactive401,
}

impl RefreshTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshTrigger::Proactive => "proactive",
            RefreshTrigger::Reactive401 => "reactive-401",
        }
    }
}

/// Why a refresh produced no usable credentials.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("no refresh token available")]
    MissingRefreshToken,

    #[error("token refresh failed: {0}")]
    Failed(String),

    #[error("token refresh was abandoned before completing")]
    Abandoned,
}

/// Outcome delivered to every caller attached to one refresh.
pub type RefreshOutcome = Result<CredentialPair, RefreshError>;

struct RefreshTicket {
    trigger: RefreshTrigger,
    waiters: VecDeque<oneshot::Sender<RefreshOutcome>>,
}

enum Registration {
    Ready(RefreshOutcome),
    Waiting(oneshot::Receiver<RefreshOutcome>),
}

impl Registration {
    async fn resolve(self) -> RefreshOutcome {
        match self {
            Registration::Ready(outcome) => outcome,
            Registration::Waiting(rx) => rx.await.unwrap_or(Err(RefreshError::Abandoned)),
        }
    }
}

/// Serializes refresh exchanges for one credential store.
pub struct RefreshCoordinator {
    transport: Arc<dyn Transport>,
    store: Arc<CredentialStore>,
    expiry: Arc<AuthExpiryNotifier>,
    endpoint: String,
    timeout: Duration,
    skew: Duration,
    ticket: Mutex<Option<RefreshTicket>>,
    refresh_calls: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<CredentialStore>,
        expiry: Arc<AuthExpiryNotifier>,
        endpoint: impl Into<String>,
        timeout: Duration,
        skew: Duration,
    ) -> Self {
        Self {
            transport,
            store,
            expiry,
            endpoint: endpoint.into(),
            timeout,
            skew,
            ticket: Mutex::new(None),
            refresh_calls: AtomicU64::new(0),
        }
    }

    /// Return usable credentials, refreshing first if needed.
    ///
    /// For `Proactive` the current pair is returned untouched unless its
    /// estimate falls inside the skew window. Without a refresh token this
    /// fails with `MissingRefreshToken` and makes no network call. Registration happens when this
    /// is called, not when the future is first polled; must be called from
    /// within a Tokio runtime.
    pub fn ensure_fresh_or_refresh(
        self: &Arc<Self>,
        trigger: RefreshTrigger,
    ) -> impl Future<Output = RefreshOutcome> + Send + use<> {
        self.register(trigger, None).resolve()
    }

    /// Refresh after the server rejected `rejected`.
    ///
    /// If the store already holds a different access token (another caller
    /// refreshed in the meantime) that pair is returned without a new exchange.
    pub fn refresh_after_rejection(
        self: &Arc<Self>,
        rejected: Option<&Secret<String>>,
    ) -> impl Future<Output = RefreshOutcome> + Send + use<> {
        self.register(RefreshTrigger::Reactive401, rejected).resolve()
    }

    /// Drop credentials and notify that the session is over.
    pub fn expire(&self) -> bool {
        self.store.clear();
        self.expiry.fire()
    }

    /// End the session only if `rejected` is still the stored access token
    /// and no refresh is open. Returns whether the session was ended.
    pub fn expire_if_current(&self, rejected: &Secret<String>) -> bool {
        let cleared = {
            let slot = self.ticket.lock();
            slot.is_none() && self.store.clear_if_current(rejected)
        };
        if !cleared {
            debug!("rejected token already replaced, keeping current credentials");
            return false;
        }
        self.expiry.fire()
    }

    pub fn in_progress(&self) -> bool {
        self.ticket.lock().is_some()
    }

    /// Callers attached to the open ticket, the one that started it included.
    pub fn waiter_count(&self) -> usize {
        self.ticket.lock().as_ref().map_or(0, |t| t.waiters.len())
    }

    /// Refresh exchanges started since construction.
    pub fn refresh_calls(&self) -> u64 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn register(
        self: &Arc<Self>,
        trigger: RefreshTrigger,
        rejected: Option<&Secret<String>>,
    ) -> Registration {
        let mut slot = self.ticket.lock();

        if let Some(ticket) = slot.as_mut() {
            let (tx, rx) = oneshot::channel();
            ticket.waiters.push_back(tx);
            debug!(
                trigger = trigger.as_str(),
                open_trigger = ticket.trigger.as_str(),
                waiters = ticket.waiters.len(),
                "joined in-flight refresh"
            );
            return Registration::Waiting(rx);
        }

        let Some(pair) = self.store.get() else {
            drop(slot);
            if trigger == RefreshTrigger::Reactive401 {
                self.expire();
            }
            return Registration::Ready(Err(RefreshError::MissingRefreshToken));
        };

        if let Some(rejected) = rejected
            && pair.access_token != *rejected
        {
            debug!("rejected token already replaced, reusing current credentials");
            return Registration::Ready(Ok(pair));
        }

        if !pair.has_refresh_token() {
            drop(slot);
            // A proactive miss leaves the session alone; the server decides when it ends
            if trigger == RefreshTrigger::Reactive401 {
                warn!("access token rejected and no refresh token available");
                self.expire();
            } else {
                debug!("no refresh token, cannot refresh proactively");
            }
            return Registration::Ready(Err(RefreshError::MissingRefreshToken));
        }

        if trigger == RefreshTrigger::Proactive && !pair.expires_within(self.skew, now_millis()) {
            return Registration::Ready(Ok(pair));
        }

        let (tx, rx) = oneshot::channel();
        *slot = Some(RefreshTicket {
            trigger,
            waiters: VecDeque::from([tx]),
        });
        drop(slot);

        let refresh = pair.refresh_token;
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_refresh(refresh, trigger).await });
        Registration::Waiting(rx)
    }

    async fn run_refresh(&self, refresh: Secret<String>, trigger: RefreshTrigger) {
        let mut guard = SettleGuard {
            coordinator: self,
            settled: false,
        };
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        debug!(trigger = trigger.as_str(), "starting token refresh");

        let outcome = match dealer_auth::refresh_credentials(
            self.transport.as_ref(),
            &self.endpoint,
            &refresh,
            self.timeout,
        )
        .await
        {
            Ok(pair) => {
                self.store.set(pair.clone());
                self.expiry.arm();
                metrics::record_refresh(trigger.as_str(), "success");
                info!(
                    trigger = trigger.as_str(),
                    expires_at = ?pair.expires_at_estimate,
                    "token refresh succeeded"
                );
                Ok(pair)
            }
            Err(e) => {
                metrics::record_refresh(trigger.as_str(), "failure");
                warn!(trigger = trigger.as_str(), error = %e, "token refresh failed, clearing credentials");
                self.expire();
                Err(RefreshError::Failed(e.to_string()))
            }
        };

        guard.settle(outcome);
    }

    /// Close the ticket and hand `outcome` to every waiter in arrival order.
    fn settle(&self, outcome: RefreshOutcome) {
        let Some(ticket) = self.ticket.lock().take() else {
            return;
        };
        let mut delivered = 0usize;
        for waiter in ticket.waiters {
            if waiter.send(outcome.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(delivered, ok = outcome.is_ok(), "refresh settled");
    }
}

/// Settles the ticket with `Abandoned` if the refresh task ends without an outcome.
struct SettleGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl SettleGuard<'_> {
    fn settle(&mut self, outcome: RefreshOutcome) {
        self.settled = true;
        self.coordinator.settle(outcome);
    }
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("refresh task ended without an outcome");
            self.coordinator.settle(Err(RefreshError::Abandoned));
        }
    }
}

impl std::fmt::Debug for RefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("endpoint", &self.endpoint)
            .field("in_progress", &self.in_progress())
            .field("refresh_calls", &self.refresh_calls())
            .finish()
    }
}
