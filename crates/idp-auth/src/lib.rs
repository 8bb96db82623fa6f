//! Identity-provider authentication library
//!
//! Holds the per-client credential model, the concurrent credential store,
//! the `WWW-Authenticate` challenge parser and the four grant strategies used
//! to exchange a credential for a bearer token. This crate performs single
//! exchanges only; caching policy, refresh serialization and scheduling live
//! in `token-cache`.
//!
//! Credential flow:
//! 1. Caller registers a client via `CredentialStore::upsert()`
//! 2. `StrategyKind::select()` picks a grant from the populated fields
//! 3. `AuthenticationClient::authenticate()` performs one exchange
//! 4. The bearer is stored via `CredentialStore::record_refresh()`
//! 5. On a 401, `challenge::parse_challenges()` recovers the server URL and
//!    client id so an unknown host can be authenticated

pub mod challenge;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod token;

pub use challenge::{ChallengeEntry, ChallengeInfo, parse_challenges};
pub use credentials::{ClientDefaults, ClientSettings, Credential, CredentialStore};
pub use error::{Error, Result};
pub use token::{AuthenticationClient, StrategyKind, TokenResponse};
