//! Per-client proactive refresh timers
//!
//! Each client id owns at most one timer task. The task waits on a `watch`
//! channel carrying its next deadline, so rearming is a single `send` and the
//! task is reused for the life of the scheduler. Dropping the scheduler drops
//! every sender, which ends every task.
//!
//! A timer fires once per arm. Success reschedules through the coordinator;
//! failure leaves the timer disarmed until some other path refreshes the
//! client again.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError, Weak};

use idp_auth::Credential;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::refresh::RefreshOutcome;

/// Something a timer can ask to refresh a client.
///
/// Uses `Pin<Box<dyn Future>>` so the scheduler can hold a `Weak<dyn RefreshTarget>`.
pub trait RefreshTarget: Send + Sync {
    fn refresh(
        &self,
        client_id: String,
    ) -> Pin<Box<dyn Future<Output = Result<RefreshOutcome>> + Send + '_>>;
}

/// Timer table keyed by client id.
pub struct AutoRefreshScheduler {
    target: Weak<dyn RefreshTarget>,
    timers: Mutex<HashMap<String, watch::Sender<Option<Instant>>>>,
}

impl AutoRefreshScheduler {
    pub fn new(target: Weak<dyn RefreshTarget>) -> Self {
        Self {
            target,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Arm the client's timer to fire once after `auto_refresh_after`.
    ///
    /// A zero interval opts the client out. The first call for a client spawns
    /// its timer task; later calls move the deadline of the same task.
    /// Must be called from within a tokio runtime.
    pub fn schedule_refresh(&self, credential: &Credential) {
        let client_id = credential.client_id();
        let after = credential.auto_refresh_after;
        if after.is_zero() {
            debug!(client_id, "auto-refresh disabled for client");
            return;
        }

        let deadline = Instant::now() + after;
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(sender) = timers.get(client_id).filter(|s| !s.is_closed()) {
            sender.send_replace(Some(deadline));
            debug!(client_id, after_secs = after.as_secs(), "auto-refresh rearmed");
            return;
        }

        let (sender, receiver) = watch::channel(Some(deadline));
        tokio::spawn(run_timer(
            client_id.to_string(),
            receiver,
            self.target.clone(),
        ));
        timers.insert(client_id.to_string(), sender);
        info!(client_id, after_secs = after.as_secs(), "auto-refresh scheduled");
    }

    /// Number of clients that own a timer task.
    pub fn active_timers(&self) -> usize {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|s| !s.is_closed())
            .count()
    }
}

/// Timer loop for one client. Exits when the sender is dropped or the target
/// is gone.
async fn run_timer(
    client_id: String,
    mut deadlines: watch::Receiver<Option<Instant>>,
    target: Weak<dyn RefreshTarget>,
) {
    loop {
        let deadline = *deadlines.borrow_and_update();

        let Some(deadline) = deadline else {
            if deadlines.changed().await.is_err() {
                break;
            }
            continue;
        };

        tokio::select! {
            changed = deadlines.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                let Some(target) = target.upgrade() else {
                    break;
                };
                debug!(client_id = %client_id, "auto-refresh timer fired");
                match target.refresh(client_id.clone()).await {
                    Ok(outcome) => debug!(client_id = %client_id, ?outcome, "auto-refresh finished"),
                    Err(e) => warn!(client_id = %client_id, error = %e, "auto-refresh failed"),
                }
                drop(target);

                // Disarmed until rearmed. A successful refresh has already
                // sent a new deadline, so this returns immediately in that case.
                if deadlines.changed().await.is_err() {
                    break;
                }
            }
        }
    }
    debug!(client_id = %client_id, "auto-refresh timer stopped");
}
