//! Error types for cache operations

/// Errors surfaced by the token cache.
///
/// Exchange failures have no variant: they are logged and reported as
/// `RefreshOutcome::Failed`, never returned.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no credential cached for client {0}")]
    MissingCredential(String),

    #[error("invalid client settings: {0}")]
    InvalidSettings(#[from] idp_auth::Error),
}

/// Result alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;
