//! Error types for identity-provider exchanges

/// Errors from a single credential exchange.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("client {client_id} has no {field} configured")]
    MissingField {
        client_id: String,
        field: &'static str,
    },

    #[error("client {0} has no identity provider server URL")]
    MissingServerUrl(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
