//! Bearer-attaching HTTP handler
//!
//! Defines the `Transport` trait that decouples the handler from the HTTP
//! client that actually sends requests, and `AuthHandler`, which attaches the
//! cached bearer for a request and answers a 401 challenge by refreshing and
//! retrying once.

pub mod handler;

pub use handler::AuthHandler;

use std::future::Future;
use std::pin::Pin;

/// Errors from sending a request through the handler.
///
/// A 401 is not an error: the final upstream response is always returned.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("token cache error: {0}")]
    Cache(#[from] token_cache::Error),
}

/// Result alias for handler operations.
pub type Result<T> = std::result::Result<T, HandlerError>;

/// Sends one request and returns the response, whatever its status.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: reqwest::Request,
    ) -> Pin<Box<dyn Future<Output = Result<reqwest::Response>> + Send + '_>>;
}

impl Transport for reqwest::Client {
    fn send(
        &self,
        request: reqwest::Request,
    ) -> Pin<Box<dyn Future<Output = Result<reqwest::Response>> + Send + '_>> {
        Box::pin(async move { Ok(self.execute(request).await?) })
    }
}
