//! `TokenProvider` facade
//!
//! The entry points request paths use. Reads of a cached bearer go straight to
//! the credential store; anything that needs an exchange goes through the
//! coordinator and its gate.

use std::sync::Arc;

use common::Secret;
use idp_auth::{
    AuthenticationClient, ChallengeEntry, ChallengeInfo, ClientDefaults, ClientSettings,
    Credential, CredentialStore, parse_challenges,
};
use tracing::{debug, info};

use crate::error::Result;
use crate::refresh::{RefreshCoordinator, RefreshOutcome, RefreshSettings};

/// One credential cache, one refresh gate, one timer table.
pub struct TokenProvider {
    store: Arc<CredentialStore>,
    coordinator: Arc<RefreshCoordinator>,
}

impl TokenProvider {
    pub fn new(defaults: ClientDefaults, http: reqwest::Client) -> Self {
        Self::with_settings(defaults, http, RefreshSettings::default())
    }

    pub fn with_settings(
        defaults: ClientDefaults,
        http: reqwest::Client,
        settings: RefreshSettings,
    ) -> Self {
        let store = Arc::new(CredentialStore::new(defaults));
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            AuthenticationClient::new(http),
            settings,
        );
        Self { store, coordinator }
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Register or update a client without contacting the identity provider.
    pub fn cache_settings(&self, settings: ClientSettings) -> Result<Credential> {
        Ok(self.store.upsert(settings)?)
    }

    /// See `RefreshCoordinator::ensure_fresh`.
    pub async fn ensure_fresh(&self, client_id: &str, force: bool) -> Result<RefreshOutcome> {
        self.coordinator.ensure_fresh(client_id, force).await
    }

    /// Upsert the client, then make sure it has a fresh bearer.
    pub async fn add_or_update_client(
        &self,
        settings: ClientSettings,
        force: bool,
    ) -> Result<RefreshOutcome> {
        let credential = self.cache_settings(settings)?;
        self.ensure_fresh(credential.client_id(), force).await
    }

    /// Register a client that relies entirely on the process defaults.
    pub async fn add_or_update_client_id(
        &self,
        client_id: &str,
        force: bool,
    ) -> Result<RefreshOutcome> {
        self.add_or_update_client(ClientSettings::new(client_id), force)
            .await
    }

    /// Learn a client from a 401 challenge.
    ///
    /// Returns the client id the challenge named, or `None` when it named none.
    pub async fn add_or_update_from_challenge(
        &self,
        challenges: &[ChallengeEntry],
        host: Option<&str>,
        force: bool,
    ) -> Result<Option<String>> {
        let info = parse_challenges(challenges);
        self.refresh_from_challenge(info, host, force, None).await
    }

    /// Cached bearer for a client.
    ///
    /// Without `force`, a cached bearer is returned as is and the gate is never
    /// touched. Otherwise the client is created from defaults if needed and
    /// refreshed. `None` means no bearer could be obtained.
    pub async fn bearer_for_client(
        &self,
        client_id: &str,
        force: bool,
    ) -> Result<Option<Secret<String>>> {
        if !force {
            if let Some(bearer) = self.cached_bearer(client_id) {
                return Ok(Some(bearer));
            }
        }

        if !self.store.contains(client_id) {
            debug!(client_id, "unknown client, creating from defaults");
            self.store.upsert(ClientSettings::new(client_id))?;
        }
        self.ensure_fresh(client_id, force).await?;
        Ok(self.cached_bearer(client_id))
    }

    /// Bearer for the client a challenge names, falling back to
    /// `fallback_client_id` when the challenge names none.
    pub async fn bearer_for_challenge(
        &self,
        challenges: &[ChallengeEntry],
        host: Option<&str>,
        force: bool,
        fallback_client_id: Option<&str>,
    ) -> Result<Option<Secret<String>>> {
        let info = parse_challenges(challenges);
        match self
            .refresh_from_challenge(info, host, force, fallback_client_id)
            .await?
        {
            Some(client_id) => Ok(self.cached_bearer(&client_id)),
            None => Ok(None),
        }
    }

    /// Bearer for whichever client last challenged `host`.
    pub async fn bearer_for_host(
        &self,
        host: &str,
        force: bool,
    ) -> Result<Option<Secret<String>>> {
        match self.store.route_for(host) {
            Some(client_id) => self.bearer_for_client(&client_id, force).await,
            None => Ok(None),
        }
    }

    fn cached_bearer(&self, client_id: &str) -> Option<Secret<String>> {
        self.store
            .lookup(client_id)
            .and_then(|c| c.bearer().cloned())
    }

    async fn refresh_from_challenge(
        &self,
        info: ChallengeInfo,
        host: Option<&str>,
        force: bool,
        fallback_client_id: Option<&str>,
    ) -> Result<Option<String>> {
        let Some(client_id) = info
            .client_id
            .or_else(|| fallback_client_id.map(str::to_string))
        else {
            debug!(host, "challenge named no client and no fallback configured");
            return Ok(None);
        };

        self.store.upsert(ClientSettings {
            server_url: info.server_url,
            ..ClientSettings::new(client_id.clone())
        })?;
        let outcome = self.ensure_fresh(&client_id, force).await?;

        if let Some(host) = host {
            self.store.record_route(host, &client_id);
        }
        info!(
            client_id = %client_id,
            host,
            outcome = outcome.label(),
            "client learned from challenge"
        );
        Ok(Some(client_id))
    }
}
