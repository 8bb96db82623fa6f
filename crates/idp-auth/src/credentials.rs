//! Per-client credentials and the concurrent credential store
//!
//! The store maps client ids to `Credential` snapshots and request hosts to
//! client ids. Both maps are `DashMap`s, so lookups and inserts from many
//! request tasks need no external lock. A credential is never removed.
//!
//! `bearer` and `last_refresh` are private to this module and only change
//! through `CredentialStore::record_refresh`, which writes both inside a single
//! map-entry guard. Readers therefore see either the old pair or the new pair.

use std::time::Duration;

use common::Secret;
use dashmap::DashMap;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// Cached authentication configuration for one client id plus its latest bearer.
#[derive(Debug, Clone)]
pub struct Credential {
    client_id: String,
    pub server_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<Secret<String>>,
    pub connection: Option<String>,
    pub realm: Option<String>,
    pub grant_type: Option<String>,
    pub client_secret: Option<Secret<String>>,
    pub audience: Option<String>,
    pub refresh_token: Option<Secret<String>>,
    /// Interval after a successful refresh before the next proactive one.
    /// `Duration::ZERO` disables auto-refresh for this client.
    pub auto_refresh_after: Duration,
    bearer: Option<Secret<String>>,
    last_refresh: Option<Instant>,
}

impl Credential {
    fn new(client_id: String, defaults: &ClientDefaults) -> Self {
        Self {
            client_id,
            server_url: None,
            username: None,
            password: None,
            connection: None,
            realm: None,
            grant_type: None,
            client_secret: None,
            audience: None,
            refresh_token: None,
            auto_refresh_after: defaults.auto_refresh_after(),
            bearer: None,
            last_refresh: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The cached bearer value, absent until the first successful exchange.
    pub fn bearer(&self) -> Option<&Secret<String>> {
        self.bearer.as_ref()
    }

    /// When the bearer was last replaced. `None` means never.
    pub fn last_refresh(&self) -> Option<Instant> {
        self.last_refresh
    }

    /// A bearer exists and was obtained less than `window` before `now`.
    pub fn is_fresh(&self, window: Duration, now: Instant) -> bool {
        match (&self.bearer, self.last_refresh) {
            (Some(_), Some(at)) => now.saturating_duration_since(at) < window,
            _ => false,
        }
    }

    /// Overwrite every field the caller supplied. Blank strings count as unset.
    fn overlay(&mut self, settings: ClientSettings) {
        overlay_text(&mut self.server_url, settings.server_url);
        overlay_text(&mut self.username, settings.username);
        overlay_secret(&mut self.password, settings.password);
        overlay_text(&mut self.connection, settings.connection);
        overlay_text(&mut self.realm, settings.realm);
        overlay_text(&mut self.grant_type, settings.grant_type);
        overlay_secret(&mut self.client_secret, settings.client_secret);
        overlay_text(&mut self.audience, settings.audience);
        overlay_secret(&mut self.refresh_token, settings.refresh_token);
        if let Some(after) = settings.auto_refresh_after {
            self.auto_refresh_after = after;
        }
    }

    /// Fill fields that are still unset from the process-wide defaults.
    fn apply_defaults(&mut self, defaults: &ClientDefaults) {
        fill_text(&mut self.server_url, &defaults.server_url);
        fill_text(&mut self.username, &defaults.username);
        fill_secret(&mut self.password, &defaults.password);
        fill_text(&mut self.connection, &defaults.connection);
        fill_secret(&mut self.client_secret, &defaults.client_secret);
        fill_text(&mut self.audience, &defaults.audience);
        fill_secret(&mut self.refresh_token, &defaults.refresh_token);
    }
}

fn overlay_text(slot: &mut Option<String>, value: Option<String>) {
    if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
        *slot = Some(value);
    }
}

fn overlay_secret(slot: &mut Option<Secret<String>>, value: Option<Secret<String>>) {
    if let Some(value) = value.filter(|v| !v.is_blank()) {
        *slot = Some(value);
    }
}

fn fill_text(slot: &mut Option<String>, default: &Option<String>) {
    if slot.is_none() {
        *slot = default.clone().filter(|v| !v.trim().is_empty());
    }
}

fn fill_secret(slot: &mut Option<Secret<String>>, default: &Option<Secret<String>>) {
    if slot.is_none() {
        *slot = default.clone().filter(|v| !v.is_blank());
    }
}

/// A partial credential used to add or update a client.
///
/// Only `client_id` is required. Fields left `None` keep their current value,
/// or take the store's default when the credential has never had one.
#[derive(Debug, Clone, Default)]
pub struct ClientSettings {
    pub client_id: String,
    pub server_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<Secret<String>>,
    pub connection: Option<String>,
    pub realm: Option<String>,
    pub grant_type: Option<String>,
    pub client_secret: Option<Secret<String>>,
    pub audience: Option<String>,
    pub refresh_token: Option<Secret<String>>,
    pub auto_refresh_after: Option<Duration>,
}

impl ClientSettings {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Self::default()
        }
    }
}

/// Process-wide defaults supplied once when the store is built.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientDefaults {
    pub server_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<Secret<String>>,
    pub connection: Option<String>,
    pub refresh_token: Option<Secret<String>>,
    pub client_secret: Option<Secret<String>>,
    pub audience: Option<String>,
    /// Seconds between proactive refreshes; 0 disables them.
    pub auto_refresh_secs: u64,
}

impl ClientDefaults {
    pub fn auto_refresh_after(&self) -> Duration {
        Duration::from_secs(self.auto_refresh_secs)
    }
}

/// Concurrent credential cache keyed by client id, plus learned host routes.
pub struct CredentialStore {
    defaults: ClientDefaults,
    credentials: DashMap<String, Credential>,
    routes: DashMap<String, String>,
}

impl CredentialStore {
    pub fn new(defaults: ClientDefaults) -> Self {
        Self {
            defaults,
            credentials: DashMap::new(),
            routes: DashMap::new(),
        }
    }

    pub fn defaults(&self) -> &ClientDefaults {
        &self.defaults
    }

    /// Add a client or overlay the supplied fields onto an existing one.
    ///
    /// The cached bearer and refresh time are never touched here. Returns a
    /// snapshot of the merged credential.
    pub fn upsert(&self, mut settings: ClientSettings) -> Result<Credential> {
        let client_id = std::mem::take(&mut settings.client_id);
        if client_id.trim().is_empty() {
            return Err(Error::MissingField {
                client_id,
                field: "client_id",
            });
        }

        let mut entry = self
            .credentials
            .entry(client_id.clone())
            .or_insert_with(|| Credential::new(client_id.clone(), &self.defaults));
        entry.overlay(settings);
        entry.apply_defaults(&self.defaults);
        debug!(client_id = %client_id, "cached client settings");
        Ok(entry.clone())
    }

    /// Snapshot of a client's credential. Absence is not an error.
    pub fn lookup(&self, client_id: &str) -> Option<Credential> {
        self.credentials.get(client_id).map(|c| c.clone())
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.credentials.contains_key(client_id)
    }

    /// Replace the bearer and its refresh time together.
    ///
    /// Returns the updated snapshot, or `None` if the client is unknown.
    pub fn record_refresh(
        &self,
        client_id: &str,
        bearer: Secret<String>,
        at: Instant,
    ) -> Option<Credential> {
        let mut entry = self.credentials.get_mut(client_id)?;
        entry.bearer = Some(bearer);
        entry.last_refresh = Some(at);
        Some(entry.clone())
    }

    /// Remember which client id protects `host`. Last write wins.
    pub fn record_route(&self, host: &str, client_id: &str) {
        self.routes.insert(host.to_string(), client_id.to_string());
        debug!(host, client_id, "recorded host route");
    }

    pub fn route_for(&self, host: &str) -> Option<String> {
        self.routes.get(host).map(|r| r.value().clone())
    }

    /// All cached client ids, in no particular order.
    pub fn client_ids(&self) -> Vec<String> {
        self.credentials.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}
