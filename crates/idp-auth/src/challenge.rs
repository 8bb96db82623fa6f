//! `WWW-Authenticate` challenge parsing
//!
//! A protected service answers an unauthenticated call with
//!
//! ```text
//! WWW-Authenticate: Bearer realm="example.auth0.com", scope="client_id=abc123 service=https://x"
//! ```
//!
//! The realm names the identity provider and the scope carries the client id
//! the caller must authenticate as. Parsing never fails: anything that is not
//! a bearer challenge, or a parameter we do not know, is skipped.

use reqwest::header::{HeaderMap, WWW_AUTHENTICATE};

/// One challenge: the auth scheme and its raw parameter string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeEntry {
    pub scheme: String,
    pub parameter: String,
}

impl ChallengeEntry {
    pub fn new(scheme: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            parameter: parameter.into(),
        }
    }

    /// Split a raw header value into scheme and parameter string.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        let (scheme, parameter) = match value.split_once(char::is_whitespace) {
            Some((scheme, rest)) => (scheme, rest.trim()),
            None => (value, ""),
        };
        Some(Self::new(scheme, parameter))
    }

    /// Split one header value into the challenges it carries.
    ///
    /// Challenges may be comma-joined in a single value. A comma-separated
    /// segment whose first word is not a `key=value` pair starts a new
    /// challenge; any other segment continues the current one's parameters.
    pub fn parse_all(value: &str) -> Vec<Self> {
        let mut entries: Vec<Self> = Vec::new();
        for segment in split_unquoted_commas(value) {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            match entries.last_mut() {
                Some(current) if !starts_challenge(segment) => {
                    if !current.parameter.is_empty() {
                        current.parameter.push_str(", ");
                    }
                    current.parameter.push_str(segment);
                }
                _ => entries.extend(Self::parse(segment)),
            }
        }
        entries
    }

    /// Every challenge on a response, in header order.
    pub fn from_headers(headers: &HeaderMap) -> Vec<Self> {
        headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(Self::parse_all)
            .collect()
    }

    fn is_bearer(&self) -> bool {
        self.scheme.eq_ignore_ascii_case("bearer")
    }
}

/// Routing information recovered from a challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChallengeInfo {
    /// Identity provider base URL, always with a scheme.
    pub server_url: Option<String>,
    pub client_id: Option<String>,
}

impl ChallengeInfo {
    pub fn is_empty(&self) -> bool {
        self.server_url.is_none() && self.client_id.is_none()
    }
}

/// Extract the identity provider URL and client id from bearer challenges.
///
/// The first realm and the first `client_id` found win.
pub fn parse_challenges<'a, I>(entries: I) -> ChallengeInfo
where
    I: IntoIterator<Item = &'a ChallengeEntry>,
{
    let mut info = ChallengeInfo::default();

    for entry in entries.into_iter().filter(|e| e.is_bearer()) {
        for (key, value) in tokenize(&entry.parameter) {
            if key.eq_ignore_ascii_case("realm") {
                if info.server_url.is_none() && !value.is_empty() {
                    info.server_url = Some(realm_to_url(&value));
                }
            } else if key.eq_ignore_ascii_case("scope") && info.client_id.is_none() {
                info.client_id = scope_client_id(&value);
            }
        }
    }

    info
}

fn realm_to_url(realm: &str) -> String {
    if realm.to_ascii_lowercase().starts_with("http") {
        realm.to_string()
    } else {
        format!("https://{realm}")
    }
}

/// An auth scheme, optionally followed by a token68 or its first parameter.
fn starts_challenge(segment: &str) -> bool {
    let (first, rest) = match segment.split_once(char::is_whitespace) {
        Some((first, rest)) => (first, rest.trim_start()),
        None => (segment, ""),
    };
    !first.contains('=') && !rest.starts_with('=')
}

/// Split on commas that sit outside double quotes.
fn split_unquoted_commas(value: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                segments.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&value[start..]);
    segments
}

/// `client_id` from a space separated list of `key=value` scope entries.
fn scope_client_id(scope: &str) -> Option<String> {
    scope
        .split_whitespace()
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, value)| key.eq_ignore_ascii_case("client_id") && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

/// Split `key="quoted value", key=token` into pairs.
///
/// Whitespace and commas separate pairs unless they sit inside quotes.
/// Bare tokens without `=` are dropped.
fn tokenize(parameter: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut chars = parameter.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace() || *c == ',').is_some() {}
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && *c != ',' && !c.is_whitespace()) {
            key.push(c);
        }
        if chars.next_if_eq(&'=').is_none() {
            continue;
        }

        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                value.push(c);
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',' && !c.is_whitespace()) {
                value.push(c);
            }
        }
        pairs.push((key, value));
    }

    pairs
}
