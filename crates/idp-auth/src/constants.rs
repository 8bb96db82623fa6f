//! Identity-provider endpoint paths and fixed grant parameters
//!
//! Paths are relative to a credential's server URL, which is normalized to end
//! with `/` before joining.

/// Refresh-token delegation endpoint
pub const DELEGATION_PATH: &str = "delegation";

/// Resource-owner password endpoint
pub const RESOURCE_OWNER_PATH: &str = "oauth/ro";

/// Token endpoint shared by password-realm and client-credentials grants
pub const TOKEN_PATH: &str = "oauth/token";

/// Grant type for refresh-token delegation
pub const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Default grant type for password-realm exchanges when none is configured
pub const PASSWORD_REALM_GRANT: &str = "http://auth0.com/oauth/grant-type/password-realm";

pub const PASSWORD_GRANT: &str = "password";

pub const CLIENT_CREDENTIALS_GRANT: &str = "client_credentials";

/// Scope requested by the delegation and resource-owner grants
pub const OPENID_SCOPE: &str = "openid";

/// Device name sent with resource-owner requests
pub const API_DEVICE: &str = "api";

/// API type sent with delegation requests
pub const APP_API_TYPE: &str = "app";
