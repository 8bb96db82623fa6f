//! Attach bearers and answer 401 challenges
//!
//! Request flow:
//! 1. A configured client id supplies the bearer, creating and refreshing the
//!    client on first use
//! 2. Otherwise a host learned from an earlier challenge supplies it
//! 3. Otherwise the request goes out without authorization
//! 4. A 401 is answered once: the challenge names the client (falling back to
//!    the configured one), that client is force-refreshed and routed for the
//!    host, and the request is resent with the new bearer

use std::sync::Arc;

use common::Secret;
use idp_auth::ChallengeEntry;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use token_cache::TokenProvider;
use tracing::{debug, warn};

use crate::{Result, Transport};

/// Wraps a `Transport` with bearer attachment and single-retry on 401.
#[derive(Clone)]
pub struct AuthHandler {
    provider: Arc<TokenProvider>,
    transport: Arc<dyn Transport>,
    client_id: Option<String>,
}

impl AuthHandler {
    pub fn new(provider: Arc<TokenProvider>, transport: Arc<dyn Transport>) -> Self {
        Self {
            provider,
            transport,
            client_id: None,
        }
    }

    /// Authenticate every request as `client_id` instead of relying on
    /// learned host routes.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into()).filter(|id: &String| !id.trim().is_empty());
        self
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn provider(&self) -> &Arc<TokenProvider> {
        &self.provider
    }

    /// Send `request`, retrying exactly once after a 401.
    ///
    /// Any existing `Authorization` header is replaced when a bearer is known.
    /// The original 401 is returned without a retry when the request body
    /// cannot be cloned, or when neither the challenge nor the configured
    /// client id yields a bearer.
    pub async fn send(&self, mut request: reqwest::Request) -> Result<reqwest::Response> {
        let host = request.url().host_str().map(str::to_string);

        let bearer = match (&self.client_id, &host) {
            (Some(client_id), _) => self.provider.bearer_for_client(client_id, false).await?,
            (None, Some(host)) => self.provider.bearer_for_host(host, false).await?,
            (None, None) => None,
        };
        if let Some(bearer) = &bearer {
            attach_bearer(&mut request, bearer);
        }

        let retry = request.try_clone();
        let response = self.transport.send(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(mut retry) = retry else {
            warn!(host = host.as_deref(), "401 on a streaming request, not retrying");
            return Ok(response);
        };

        let challenges = ChallengeEntry::from_headers(response.headers());
        let bearer = self
            .provider
            .bearer_for_challenge(
                &challenges,
                host.as_deref(),
                true,
                self.client_id.as_deref(),
            )
            .await?;

        let Some(bearer) = bearer else {
            warn!(
                host = host.as_deref(),
                "401 with no usable challenge and no bearer, returning as is"
            );
            return Ok(response);
        };

        attach_bearer(&mut retry, &bearer);
        warn!(host = host.as_deref(), url = %retry.url(), "retrying after 401 challenge");
        Ok(self.transport.send(retry).await?)
    }
}

fn attach_bearer(request: &mut reqwest::Request, bearer: &Secret<String>) {
    match HeaderValue::from_str(&format!("Bearer {}", bearer.expose())) {
        Ok(mut value) => {
            value.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Err(e) => debug!(error = %e, "cached bearer is not a valid header value, skipping"),
    }
}
