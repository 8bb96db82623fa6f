//! Bearer-token cache for identity-provider clients
//!
//! Wraps the `idp-auth` credential store with the policy that makes it usable
//! from many request tasks at once: a single refresh gate per provider, a
//! freshness window that collapses redundant exchanges, and a per-client
//! timer that renews bearers before callers need them.
//!
//! Token lifecycle:
//! 1. Caller registers a client via `TokenProvider::add_or_update_client()`
//! 2. `RefreshCoordinator::ensure_fresh()` takes the gate and runs one exchange
//! 3. The bearer and refresh time are stored together
//! 4. `AutoRefreshScheduler` arms the client's timer for `auto_refresh_after`
//! 5. The timer fires, goes back to step 2, and rearms on success
//! 6. Request paths read the cached bearer without touching the gate

pub mod error;
pub mod provider;
pub mod refresh;
pub mod scheduler;

pub use error::{Error, Result};
pub use provider::TokenProvider;
pub use refresh::{RefreshCoordinator, RefreshOutcome, RefreshSettings};
pub use scheduler::{AutoRefreshScheduler, RefreshTarget};
