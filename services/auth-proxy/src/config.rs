//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Identity-provider secrets may be supplied through `IDP_PASSWORD`,
//! `IDP_CLIENT_SECRET` and `IDP_REFRESH_TOKEN` so they need not live in the
//! TOML file. Environment values override the file.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use idp_auth::{ClientDefaults, ClientSettings};
use serde::Deserialize;
use token_cache::RefreshSettings;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Process-wide credential defaults
    #[serde(default)]
    pub defaults: ClientDefaults,
    /// Clients registered at startup
    #[serde(default)]
    pub clients: Vec<ServiceClient>,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// How the proxy authenticates upstream calls
#[derive(Debug, Deserialize)]
pub struct IdentityConfig {
    /// Authenticate every upstream call as this client. Without it, the
    /// client is learned from the upstream's 401 challenge.
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default = "default_freshness_window")]
    pub freshness_window_secs: u64,
    #[serde(default = "default_gate_timeout")]
    pub gate_timeout_secs: u64,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            freshness_window_secs: default_freshness_window(),
            gate_timeout_secs: default_gate_timeout(),
        }
    }
}

impl IdentityConfig {
    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            freshness_window: Duration::from_secs(self.freshness_window_secs),
            gate_timeout: Duration::from_secs(self.gate_timeout_secs),
        }
    }
}

/// One `[[clients]]` entry
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceClient {
    pub client_id: String,
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default, alias = "user")]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<Secret<String>>,
    #[serde(default)]
    pub connection: Option<String>,
    #[serde(default)]
    pub realm: Option<String>,
    #[serde(default)]
    pub grant_type: Option<String>,
    #[serde(default)]
    pub client_secret: Option<Secret<String>>,
    #[serde(default)]
    pub audience: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<Secret<String>>,
    /// Overrides `defaults.auto_refresh_secs` for this client; 0 disables.
    #[serde(default)]
    pub auto_refresh_secs: Option<u64>,
}

impl From<ServiceClient> for ClientSettings {
    fn from(client: ServiceClient) -> Self {
        ClientSettings {
            client_id: client.client_id,
            server_url: client.server_url,
            username: client.username,
            password: client.password,
            connection: client.connection,
            realm: client.realm,
            grant_type: client.grant_type,
            client_secret: client.client_secret,
            audience: client.audience,
            refresh_token: client.refresh_token,
            auto_refresh_after: client.auto_refresh_secs.map(Duration::from_secs),
        }
    }
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_freshness_window() -> u64 {
    5
}

fn default_gate_timeout() -> u64 {
    5
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config.overlay_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Secrets from the environment replace the file's defaults.
    fn overlay_env(&mut self) -> common::Result<()> {
        if let Some(password) = secret_from_env("IDP_PASSWORD")? {
            self.defaults.password = Some(password);
        }
        if let Some(secret) = secret_from_env("IDP_CLIENT_SECRET")? {
            self.defaults.client_secret = Some(secret);
        }
        if let Some(token) = secret_from_env("IDP_REFRESH_TOKEN")? {
            self.defaults.refresh_token = Some(token);
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        if !is_http_url(&self.proxy.upstream_url) {
            return Err(common::Error::Config(format!(
                "upstream_url must start with http:// or https://, got: {}",
                self.proxy.upstream_url
            )));
        }

        if self.proxy.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.proxy.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.identity.gate_timeout_secs == 0 {
            return Err(common::Error::Config(
                "gate_timeout_secs must be greater than 0".into(),
            ));
        }

        if let Some(url) = &self.defaults.server_url {
            if !is_http_url(url) {
                return Err(common::Error::Config(format!(
                    "defaults.server_url must start with http:// or https://, got: {url}"
                )));
            }
        }

        let mut seen = HashSet::new();
        for client in &self.clients {
            if client.client_id.trim().is_empty() {
                return Err(common::Error::Config(
                    "every [[clients]] entry needs a client_id".into(),
                ));
            }
            if !seen.insert(client.client_id.as_str()) {
                return Err(common::Error::Config(format!(
                    "client_id {} is configured more than once",
                    client.client_id
                )));
            }
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("auth-proxy.toml")
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Unset and blank variables yield `None`; non-unicode values are an error.
fn secret_from_env(name: &str) -> common::Result<Option<Secret<String>>> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(Secret::new(value))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(common::Error::Env {
            name: name.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const SECRET_VARS: &[&str] = &["IDP_PASSWORD", "IDP_CLIENT_SECRET", "IDP_REFRESH_TOKEN"];

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    fn clear_secret_env() {
        for name in SECRET_VARS {
            unsafe { remove_env(name) };
        }
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("auth-proxy.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn valid_toml() -> &'static str {
        r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.example.com"

[identity]
client_id = "svc-client"

[defaults]
server_url = "https://tenant.example.com"
username = "svc-user"
password = "file-password"
connection = "Username-Password-Authentication"
auto_refresh_secs = 600

[[clients]]
client_id = "reporting"
user = "reporter"
realm = "employees"
audience = "https://reports.example.com"

[[clients]]
client_id = "machine"
client_secret = "m-secret"
audience = "https://api.example.com"
auto_refresh_secs = 0
"#
    }

    #[test]
    fn test_load_valid_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.proxy.upstream_url, "https://api.example.com");
        assert_eq!(config.proxy.timeout_secs, 60);
        assert_eq!(config.proxy.max_connections, 1000);
        assert_eq!(config.identity.client_id.as_deref(), Some("svc-client"));
        assert_eq!(
            config.defaults.server_url.as_deref(),
            Some("https://tenant.example.com")
        );
        assert_eq!(
            config.defaults.password.as_ref().unwrap().expose(),
            "file-password"
        );
        assert_eq!(config.defaults.auto_refresh_secs, 600);
        assert_eq!(config.clients.len(), 2);
        assert_eq!(config.clients[0].username.as_deref(), Some("reporter"));
        assert_eq!(config.clients[1].auto_refresh_secs, Some(0));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "http://localhost:9000"
"#,
        );

        let config = Config::load(&path).unwrap();
        assert!(config.identity.client_id.is_none());
        assert!(config.clients.is_empty());
        assert!(config.defaults.server_url.is_none());
        assert_eq!(config.defaults.auto_refresh_secs, 0);

        let settings = config.identity.refresh_settings();
        assert_eq!(settings.freshness_window, Duration::from_secs(5));
        assert_eq!(settings.gate_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");

        let result = Config::load(&path);
        assert!(matches!(result, Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_secrets_from_env_override_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe { set_env("IDP_PASSWORD", "env-password") };
        unsafe { set_env("IDP_CLIENT_SECRET", "env-secret") };
        unsafe { set_env("IDP_REFRESH_TOKEN", "env-refresh") };
        let config = Config::load(&path).unwrap();
        clear_secret_env();

        assert_eq!(
            config.defaults.password.as_ref().unwrap().expose(),
            "env-password"
        );
        assert_eq!(
            config.defaults.client_secret.as_ref().unwrap().expose(),
            "env-secret"
        );
        assert_eq!(
            config.defaults.refresh_token.as_ref().unwrap().expose(),
            "env-refresh"
        );
    }

    #[test]
    fn test_blank_env_secret_is_ignored() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        unsafe { set_env("IDP_PASSWORD", "   ") };
        let config = Config::load(&path).unwrap();
        clear_secret_env();

        assert_eq!(
            config.defaults.password.as_ref().unwrap().expose(),
            "file-password"
        );
    }

    #[test]
    fn test_secrets_are_redacted_in_debug() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, valid_toml());

        let config = Config::load(&path).unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("file-password"), "got: {debug}");
        assert!(!debug.contains("m-secret"), "got: {debug}");
    }

    #[test]
    fn test_service_client_maps_to_settings() {
        let client = ServiceClient {
            client_id: "c1".into(),
            server_url: Some("https://idp.example.com".into()),
            username: Some("alice".into()),
            password: Some(Secret::from("pw")),
            connection: None,
            realm: Some("employees".into()),
            grant_type: None,
            client_secret: None,
            audience: Some("aud".into()),
            refresh_token: None,
            auto_refresh_secs: Some(120),
        };

        let settings = ClientSettings::from(client);
        assert_eq!(settings.client_id, "c1");
        assert_eq!(settings.username.as_deref(), Some("alice"));
        assert_eq!(settings.password.as_ref().unwrap().expose(), "pw");
        assert_eq!(settings.realm.as_deref(), Some("employees"));
        assert_eq!(settings.auto_refresh_after, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("auth-proxy.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(path, PathBuf::from("/cli/wins.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    fn assert_rejected(contents: &str, expected: &str) {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_secret_env();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, contents);

        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains(expected), "expected {expected:?} in: {err}");
    }

    #[test]
    fn test_invalid_upstream_url_rejected() {
        assert_rejected(
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "api.example.com"
"#,
            "upstream_url must start with http",
        );
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert_rejected(
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.example.com"
timeout_secs = 0
"#,
            "timeout_secs",
        );
    }

    #[test]
    fn test_zero_max_connections_rejected() {
        assert_rejected(
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.example.com"
max_connections = 0
"#,
            "max_connections",
        );
    }

    #[test]
    fn test_zero_gate_timeout_rejected() {
        assert_rejected(
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.example.com"

[identity]
gate_timeout_secs = 0
"#,
            "gate_timeout_secs",
        );
    }

    #[test]
    fn test_default_server_url_needs_scheme() {
        assert_rejected(
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.example.com"

[defaults]
server_url = "tenant.example.com"
"#,
            "defaults.server_url",
        );
    }

    #[test]
    fn test_blank_client_id_rejected() {
        assert_rejected(
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.example.com"

[[clients]]
client_id = " "
"#,
            "needs a client_id",
        );
    }

    #[test]
    fn test_duplicate_client_id_rejected() {
        assert_rejected(
            r#"
[proxy]
listen_addr = "127.0.0.1:8080"
upstream_url = "https://api.example.com"

[[clients]]
client_id = "dup"

[[clients]]
client_id = "dup"
"#,
            "more than once",
        );
    }
}
