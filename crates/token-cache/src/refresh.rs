//! Gated bearer refresh
//!
//! `RefreshCoordinator::ensure_fresh` is the only path that changes a cached
//! bearer. All clients of one coordinator share a single gate, so at most one
//! exchange is in flight per coordinator. Freshness is checked again after the
//! gate is taken, which collapses a burst of callers into one exchange.
//!
//! Exchange failures stop here: they are logged and counted, and the caller
//! gets `RefreshOutcome::Failed` with the previous bearer still cached.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use idp_auth::{AuthenticationClient, CredentialStore, StrategyKind};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::scheduler::{AutoRefreshScheduler, RefreshTarget};

/// Timing policy for the refresh gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSettings {
    /// A bearer obtained less than this long ago is not refreshed again
    /// unless forced.
    pub freshness_window: Duration,
    /// Longest wait for the gate before giving up on this refresh.
    pub gate_timeout: Duration,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(5),
            gate_timeout: Duration::from_secs(5),
        }
    }
}

/// What `ensure_fresh` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// An exchange succeeded and the bearer was replaced.
    Refreshed,
    /// The cached bearer is inside the freshness window; no exchange.
    AlreadyFresh,
    /// The exchange failed; the previous bearer (if any) is kept.
    Failed,
    /// The gate could not be taken in time; nothing was attempted.
    GateTimeout,
}

impl RefreshOutcome {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            RefreshOutcome::Refreshed => "refreshed",
            RefreshOutcome::AlreadyFresh => "already_fresh",
            RefreshOutcome::Failed => "failed",
            RefreshOutcome::GateTimeout => "gate_timeout",
        }
    }
}

/// Serializes exchanges and hands refreshed credentials to the scheduler.
pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    client: AuthenticationClient,
    gate: Mutex<()>,
    settings: RefreshSettings,
    scheduler: AutoRefreshScheduler,
}

impl RefreshCoordinator {
    /// Build a coordinator whose scheduler calls back into it.
    pub fn new(
        store: Arc<CredentialStore>,
        client: AuthenticationClient,
        settings: RefreshSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|coordinator: &Weak<Self>| {
            let target: Weak<dyn RefreshTarget> = coordinator.clone();
            Self {
                store,
                client,
                gate: Mutex::new(()),
                settings,
                scheduler: AutoRefreshScheduler::new(target),
            }
        })
    }

    pub fn settings(&self) -> RefreshSettings {
        self.settings
    }

    pub fn scheduler(&self) -> &AutoRefreshScheduler {
        &self.scheduler
    }

    /// Make sure `client_id` has a bearer no older than the freshness window.
    ///
    /// Returns `MissingCredential` for unknown clients. Every other failure
    /// is reported through the outcome.
    pub async fn ensure_fresh(&self, client_id: &str, force: bool) -> Result<RefreshOutcome> {
        if !self.store.contains(client_id) {
            return Err(Error::MissingCredential(client_id.to_string()));
        }

        let _gate = match tokio::time::timeout(self.settings.gate_timeout, self.gate.lock()).await
        {
            Ok(guard) => guard,
            Err(_) => {
                warn!(
                    client_id,
                    timeout_ms = self.settings.gate_timeout.as_millis() as u64,
                    "could not acquire refresh lock, continuing with cached bearer"
                );
                metrics::counter!("token_refresh_gate_timeouts_total").increment(1);
                return Ok(RefreshOutcome::GateTimeout);
            }
        };

        // Snapshot taken under the gate so concurrent refreshes are visible
        let credential = self
            .store
            .lookup(client_id)
            .ok_or_else(|| Error::MissingCredential(client_id.to_string()))?;
        let kind = StrategyKind::select(&credential);

        if !force && credential.is_fresh(self.settings.freshness_window, Instant::now()) {
            debug!(client_id, "bearer refreshed within freshness window, skipping");
            record_refresh(kind, RefreshOutcome::AlreadyFresh);
            return Ok(RefreshOutcome::AlreadyFresh);
        }

        let subject = kind.subject(&credential);
        match self.client.authenticate(kind, &credential).await {
            Ok(bearer) => {
                let updated = self
                    .store
                    .record_refresh(client_id, bearer, Instant::now())
                    .ok_or_else(|| Error::MissingCredential(client_id.to_string()))?;
                info!(
                    client_id,
                    strategy = kind.label(),
                    subject,
                    "authenticated with identity provider"
                );
                record_refresh(kind, RefreshOutcome::Refreshed);
                self.scheduler.schedule_refresh(&updated);
                Ok(RefreshOutcome::Refreshed)
            }
            Err(e) => {
                error!(
                    client_id,
                    strategy = kind.label(),
                    subject,
                    error = %e,
                    "authentication failed, keeping previous bearer"
                );
                record_refresh(kind, RefreshOutcome::Failed);
                Ok(RefreshOutcome::Failed)
            }
        }
    }
}

impl RefreshTarget for RefreshCoordinator {
    fn refresh(
        &self,
        client_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshOutcome>> + Send + '_>> {
        Box::pin(async move { self.ensure_fresh(&client_id, false).await })
    }
}

fn record_refresh(kind: StrategyKind, outcome: RefreshOutcome) {
    metrics::counter!(
        "token_refresh_total",
        "strategy" => kind.label(),
        "outcome" => outcome.label()
    )
    .increment(1);
}
