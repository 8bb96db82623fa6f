//! Types shared across the bearer-cache workspace

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
