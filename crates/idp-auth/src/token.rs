//! Grant strategies and the identity-provider client
//!
//! Four grants can turn a credential into a bearer:
//! 1. Refresh-token delegation (`delegation`)
//! 2. Resource-owner password (`oauth/ro`)
//! 3. Password-realm (`oauth/token`)
//! 4. Client credentials (`oauth/token`)
//!
//! `StrategyKind::select` picks one from the fields populated on a credential
//! snapshot. `AuthenticationClient::authenticate` then performs exactly one
//! POST and returns the bearer. Nothing here touches the credential store.

use common::Secret;
use serde::{Deserialize, Serialize};

use crate::constants::{
    API_DEVICE, APP_API_TYPE, CLIENT_CREDENTIALS_GRANT, DELEGATION_PATH, JWT_BEARER_GRANT,
    OPENID_SCOPE, PASSWORD_GRANT, PASSWORD_REALM_GRANT, RESOURCE_OWNER_PATH, TOKEN_PATH,
};
use crate::credentials::Credential;
use crate::error::{Error, Result};

/// Which grant a refresh uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Delegation,
    ResourceOwner,
    PasswordRealm,
    ClientCredentials,
}

impl StrategyKind {
    /// Pick the grant for a credential snapshot.
    ///
    /// Precedence: refresh token, then client secret with audience, then an
    /// explicit realm, then username/password.
    pub fn select(credential: &Credential) -> Self {
        if credential.refresh_token.is_some() {
            StrategyKind::Delegation
        } else if credential.client_secret.is_some() && credential.audience.is_some() {
            StrategyKind::ClientCredentials
        } else if credential.realm.is_some() {
            StrategyKind::PasswordRealm
        } else {
            StrategyKind::ResourceOwner
        }
    }

    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            StrategyKind::Delegation => "delegation",
            StrategyKind::ResourceOwner => "resource_owner",
            StrategyKind::PasswordRealm => "password_realm",
            StrategyKind::ClientCredentials => "client_credentials",
        }
    }

    /// Endpoint path relative to the server URL.
    pub fn path(&self) -> &'static str {
        match self {
            StrategyKind::Delegation => DELEGATION_PATH,
            StrategyKind::ResourceOwner => RESOURCE_OWNER_PATH,
            StrategyKind::PasswordRealm | StrategyKind::ClientCredentials => TOKEN_PATH,
        }
    }

    /// The non-secret field that identifies who is authenticating, for logs.
    pub fn subject<'a>(&self, credential: &'a Credential) -> &'a str {
        match self {
            StrategyKind::Delegation => "refresh token",
            StrategyKind::ResourceOwner | StrategyKind::PasswordRealm => {
                credential.username.as_deref().unwrap_or("<no username>")
            }
            StrategyKind::ClientCredentials => {
                credential.audience.as_deref().unwrap_or("<no audience>")
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct DelegationRequest<'a> {
    api_type: &'static str,
    grant_type: &'static str,
    scope: &'static str,
    client_id: &'a str,
    target: &'a str,
    refresh_token: &'a str,
}

#[derive(Debug, Serialize)]
struct ResourceOwnerRequest<'a> {
    client_id: &'a str,
    connection: &'a str,
    device: &'static str,
    grant_type: &'static str,
    password: &'a str,
    scope: &'static str,
    username: &'a str,
}

#[derive(Debug, Serialize)]
struct PasswordRealmRequest<'a> {
    client_id: &'a str,
    realm: &'a str,
    username: &'a str,
    password: &'a str,
    grant_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    audience: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ClientCredentialsRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'static str,
    audience: &'a str,
}

/// Response body shared by all grant endpoints. Every field is optional
/// because each endpoint returns a different subset.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl TokenResponse {
    /// The bearer for a strategy: `id_token` for delegation and resource-owner,
    /// `access_token` for the `oauth/token` grants. Falls back to the other
    /// token when the preferred one is absent.
    pub fn into_bearer(self, kind: StrategyKind) -> Option<String> {
        let (preferred, fallback) = match kind {
            StrategyKind::Delegation | StrategyKind::ResourceOwner => {
                (self.id_token, self.access_token)
            }
            StrategyKind::PasswordRealm | StrategyKind::ClientCredentials => {
                (self.access_token, self.id_token)
            }
        };
        preferred
            .filter(|t| !t.is_empty())
            .or(fallback.filter(|t| !t.is_empty()))
    }
}

/// Thin JSON client for the identity provider's grant endpoints.
#[derive(Debug, Clone)]
pub struct AuthenticationClient {
    http: reqwest::Client,
}

impl AuthenticationClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Run one exchange for `kind` and return the resulting bearer.
    pub async fn authenticate(
        &self,
        kind: StrategyKind,
        credential: &Credential,
    ) -> Result<Secret<String>> {
        let client_id = credential.client_id();
        let server_url = credential
            .server_url
            .as_deref()
            .ok_or_else(|| Error::MissingServerUrl(client_id.to_string()))?;

        let response = match kind {
            StrategyKind::Delegation => {
                let refresh_token = required_secret(credential, &credential.refresh_token, "refresh token")?;
                let body = DelegationRequest {
                    api_type: APP_API_TYPE,
                    grant_type: JWT_BEARER_GRANT,
                    scope: OPENID_SCOPE,
                    client_id,
                    target: client_id,
                    refresh_token,
                };
                self.post(server_url, kind.path(), &body).await?
            }
            StrategyKind::ResourceOwner => {
                let body = ResourceOwnerRequest {
                    client_id,
                    connection: required(credential, &credential.connection, "connection")?,
                    device: API_DEVICE,
                    grant_type: PASSWORD_GRANT,
                    password: required_secret(credential, &credential.password, "password")?,
                    scope: OPENID_SCOPE,
                    username: required(credential, &credential.username, "username")?,
                };
                self.post(server_url, kind.path(), &body).await?
            }
            StrategyKind::PasswordRealm => {
                let body = PasswordRealmRequest {
                    client_id,
                    realm: required(credential, &credential.realm, "realm")?,
                    username: required(credential, &credential.username, "username")?,
                    password: required_secret(credential, &credential.password, "password")?,
                    grant_type: credential
                        .grant_type
                        .as_deref()
                        .unwrap_or(PASSWORD_REALM_GRANT),
                    audience: credential.audience.as_deref(),
                };
                self.post(server_url, kind.path(), &body).await?
            }
            StrategyKind::ClientCredentials => {
                let body = ClientCredentialsRequest {
                    client_id,
                    client_secret: required_secret(
                        credential,
                        &credential.client_secret,
                        "client secret",
                    )?,
                    grant_type: CLIENT_CREDENTIALS_GRANT,
                    audience: required(credential, &credential.audience, "audience")?,
                };
                self.post(server_url, kind.path(), &body).await?
            }
        };

        response.into_bearer(kind).map(Secret::new).ok_or_else(|| {
            Error::TokenExchange(format!(
                "{} response for client {client_id} carried no token",
                kind.label()
            ))
        })
    }

    /// POST a JSON body to `server_url` + `path` and parse the token response.
    pub async fn post<B: Serialize + ?Sized>(
        &self,
        server_url: &str,
        path: &str,
        body: &B,
    ) -> Result<TokenResponse> {
        let url = endpoint(server_url, path);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Http(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<no body>"));

            // 401/403 means the configured credentials were rejected
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(Error::InvalidCredentials(format!(
                    "{url} rejected credentials ({status}): {body}"
                )));
            }

            return Err(Error::TokenExchange(format!(
                "{url} returned {status}: {body}"
            )));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| Error::TokenExchange(format!("invalid response from {url}: {e}")))
    }
}

/// Join a server URL and endpoint path with exactly one `/` between them.
pub fn endpoint(server_url: &str, path: &str) -> String {
    if server_url.ends_with('/') {
        format!("{server_url}{path}")
    } else {
        format!("{server_url}/{path}")
    }
}

fn required<'a>(
    credential: &Credential,
    value: &'a Option<String>,
    field: &'static str,
) -> Result<&'a str> {
    value.as_deref().ok_or_else(|| Error::MissingField {
        client_id: credential.client_id().to_string(),
        field,
    })
}

fn required_secret<'a>(
    credential: &Credential,
    value: &'a Option<Secret<String>>,
    field: &'static str,
) -> Result<&'a str> {
    value
        .as_ref()
        .map(|s| s.expose().as_str())
        .ok_or_else(|| Error::MissingField {
            client_id: credential.client_id().to_string(),
            field,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{ClientDefaults, ClientSettings, CredentialStore};
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credential(settings: ClientSettings) -> Credential {
        CredentialStore::new(ClientDefaults::default())
            .upsert(settings)
            .unwrap()
    }

    #[test]
    fn refresh_token_selects_delegation() {
        let cred = credential(ClientSettings {
            refresh_token: Some(Secret::from("rt")),
            username: Some("u".into()),
            password: Some(Secret::from("p")),
            client_secret: Some(Secret::from("s")),
            audience: Some("aud".into()),
            realm: Some("r".into()),
            ..ClientSettings::new("c")
        });
        assert_eq!(StrategyKind::select(&cred), StrategyKind::Delegation);
    }

    #[test]
    fn secret_and_audience_select_client_credentials() {
        let cred = credential(ClientSettings {
            client_secret: Some(Secret::from("s")),
            audience: Some("aud".into()),
            realm: Some("r".into()),
            ..ClientSettings::new("c")
        });
        assert_eq!(StrategyKind::select(&cred), StrategyKind::ClientCredentials);
    }

    #[test]
    fn secret_without_audience_does_not_select_client_credentials() {
        let cred = credential(ClientSettings {
            client_secret: Some(Secret::from("s")),
            username: Some("u".into()),
            password: Some(Secret::from("p")),
            ..ClientSettings::new("c")
        });
        assert_eq!(StrategyKind::select(&cred), StrategyKind::ResourceOwner);
    }

    #[test]
    fn realm_selects_password_realm() {
        let cred = credential(ClientSettings {
            realm: Some("employees".into()),
            username: Some("u".into()),
            password: Some(Secret::from("p")),
            ..ClientSettings::new("c")
        });
        assert_eq!(StrategyKind::select(&cred), StrategyKind::PasswordRealm);
    }

    #[test]
    fn username_password_selects_resource_owner() {
        let cred = credential(ClientSettings {
            username: Some("u".into()),
            password: Some(Secret::from("p")),
            ..ClientSettings::new("c")
        });
        assert_eq!(StrategyKind::select(&cred), StrategyKind::ResourceOwner);
    }

    #[test]
    fn selection_follows_field_changes() {
        let store = CredentialStore::new(ClientDefaults::default());
        let cred = store
            .upsert(ClientSettings {
                username: Some("u".into()),
                password: Some(Secret::from("p")),
                ..ClientSettings::new("c")
            })
            .unwrap();
        assert_eq!(StrategyKind::select(&cred), StrategyKind::ResourceOwner);

        let cred = store
            .upsert(ClientSettings {
                refresh_token: Some(Secret::from("rt")),
                ..ClientSettings::new("c")
            })
            .unwrap();
        assert_eq!(StrategyKind::select(&cred), StrategyKind::Delegation);
    }

    #[test]
    fn endpoint_joins_with_single_slash() {
        assert_eq!(
            endpoint("https://idp.example.com", "oauth/ro"),
            "https://idp.example.com/oauth/ro"
        );
        assert_eq!(
            endpoint("https://idp.example.com/", "delegation"),
            "https://idp.example.com/delegation"
        );
    }

    #[test]
    fn bearer_field_depends_on_strategy() {
        let response = || TokenResponse {
            id_token: Some("id".into()),
            access_token: Some("access".into()),
            ..TokenResponse::default()
        };
        assert_eq!(response().into_bearer(StrategyKind::Delegation).unwrap(), "id");
        assert_eq!(response().into_bearer(StrategyKind::ResourceOwner).unwrap(), "id");
        assert_eq!(response().into_bearer(StrategyKind::PasswordRealm).unwrap(), "access");
        assert_eq!(
            response().into_bearer(StrategyKind::ClientCredentials).unwrap(),
            "access"
        );

        let only_access = TokenResponse {
            access_token: Some("access".into()),
            ..TokenResponse::default()
        };
        assert_eq!(only_access.into_bearer(StrategyKind::Delegation).unwrap(), "access");
        assert!(TokenResponse::default().into_bearer(StrategyKind::Delegation).is_none());
    }

    #[test]
    fn token_response_tolerates_partial_bodies() {
        let json = r#"{"id_token":"eyJ","token_type":"Bearer"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.id_token.as_deref(), Some("eyJ"));
        assert!(token.access_token.is_none());
        assert!(token.expires_in.is_none());
    }

    #[tokio::test]
    async fn delegation_posts_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/delegation"))
            .and(body_json(serde_json::json!({
                "api_type": "app",
                "grant_type": "urn:ietf:params:oauth:grant-type:jwt-bearer",
                "scope": "openid",
                "client_id": "c1",
                "target": "c1",
                "refresh_token": "rt_1"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id_token": "id-from-delegation",
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cred = credential(ClientSettings {
            server_url: Some(server.uri()),
            refresh_token: Some(Secret::from("rt_1")),
            ..ClientSettings::new("c1")
        });
        let client = AuthenticationClient::new(reqwest::Client::new());
        let bearer = client
            .authenticate(StrategyKind::Delegation, &cred)
            .await
            .unwrap();
        assert_eq!(bearer.expose(), "id-from-delegation");
    }

    #[tokio::test]
    async fn resource_owner_posts_password_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/ro"))
            .and(body_json(serde_json::json!({
                "client_id": "c1",
                "connection": "db",
                "device": "api",
                "grant_type": "password",
                "password": "pw",
                "scope": "openid",
                "username": "alice"
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"id_token": "ro"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cred = credential(ClientSettings {
            server_url: Some(format!("{}/", server.uri())),
            username: Some("alice".into()),
            password: Some(Secret::from("pw")),
            connection: Some("db".into()),
            ..ClientSettings::new("c1")
        });
        let client = AuthenticationClient::new(reqwest::Client::new());
        let bearer = client
            .authenticate(StrategyKind::ResourceOwner, &cred)
            .await
            .unwrap();
        assert_eq!(bearer.expose(), "ro");
    }

    #[tokio::test]
    async fn password_realm_defaults_grant_type() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_json(serde_json::json!({
                "client_id": "c1",
                "realm": "employees",
                "username": "alice",
                "password": "pw",
                "grant_type": "http://auth0.com/oauth/grant-type/password-realm",
                "audience": "https://api.example.com"
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "realm-at"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cred = credential(ClientSettings {
            server_url: Some(server.uri()),
            username: Some("alice".into()),
            password: Some(Secret::from("pw")),
            realm: Some("employees".into()),
            audience: Some("https://api.example.com".into()),
            ..ClientSettings::new("c1")
        });
        let client = AuthenticationClient::new(reqwest::Client::new());
        let bearer = client
            .authenticate(StrategyKind::PasswordRealm, &cred)
            .await
            .unwrap();
        assert_eq!(bearer.expose(), "realm-at");
    }

    #[tokio::test]
    async fn client_credentials_posts_secret_and_audience() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_json(serde_json::json!({
                "client_id": "c1",
                "client_secret": "shh",
                "grant_type": "client_credentials",
                "audience": "https://api.example.com"
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "cc-at", "expires_in": 86400})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let cred = credential(ClientSettings {
            server_url: Some(server.uri()),
            client_secret: Some(Secret::from("shh")),
            audience: Some("https://api.example.com".into()),
            ..ClientSettings::new("c1")
        });
        let client = AuthenticationClient::new(reqwest::Client::new());
        let bearer = client
            .authenticate(StrategyKind::ClientCredentials, &cred)
            .await
            .unwrap();
        assert_eq!(bearer.expose(), "cc-at");
    }

    #[tokio::test]
    async fn rejected_credentials_map_to_invalid_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/ro"))
            .respond_with(ResponseTemplate::new(401).set_body_string("wrong password"))
            .mount(&server)
            .await;

        let cred = credential(ClientSettings {
            server_url: Some(server.uri()),
            username: Some("alice".into()),
            password: Some(Secret::from("bad")),
            connection: Some("db".into()),
            ..ClientSettings::new("c1")
        });
        let client = AuthenticationClient::new(reqwest::Client::new());
        let err = client
            .authenticate(StrategyKind::ResourceOwner, &cred)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCredentials(_)), "got {err:?}");
        assert!(err.to_string().contains("wrong password"));
    }

    #[tokio::test]
    async fn server_errors_map_to_token_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let cred = credential(ClientSettings {
            server_url: Some(server.uri()),
            refresh_token: Some(Secret::from("rt")),
            ..ClientSettings::new("c1")
        });
        let client = AuthenticationClient::new(reqwest::Client::new());
        let err = client
            .authenticate(StrategyKind::Delegation, &cred)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenExchange(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn missing_token_in_body_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let cred = credential(ClientSettings {
            server_url: Some(server.uri()),
            refresh_token: Some(Secret::from("rt")),
            ..ClientSettings::new("c1")
        });
        let client = AuthenticationClient::new(reqwest::Client::new());
        let err = client
            .authenticate(StrategyKind::Delegation, &cred)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("carried no token"));
    }

    #[tokio::test]
    async fn missing_fields_fail_before_any_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let cred = credential(ClientSettings {
            server_url: Some(server.uri()),
            username: Some("alice".into()),
            ..ClientSettings::new("c1")
        });
        let client = AuthenticationClient::new(reqwest::Client::new());
        let err = client
            .authenticate(StrategyKind::ResourceOwner, &cred)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingField { field: "connection", .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn missing_server_url_is_reported() {
        let cred = credential(ClientSettings {
            refresh_token: Some(Secret::from("rt")),
            ..ClientSettings::new("c1")
        });
        let client = AuthenticationClient::new(reqwest::Client::new());
        let err = client
            .authenticate(StrategyKind::Delegation, &cred)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingServerUrl(ref id) if id == "c1"));
    }
}
