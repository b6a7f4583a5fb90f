//! Resolution of the single auth header an API connector sends.

use reqwest::RequestBuilder;
use serde_json::{Map, Value};

use crate::connectors::first_str;

const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// How requests authenticate. Chosen once per `initialize`.
///
/// Priority when several credential shapes are present: API key, bearer
/// token, basic credentials, OAuth access token.
#[derive(Clone, PartialEq)]
pub enum AuthScheme {
    ApiKey { header: String, value: String },
    Bearer(String),
    Basic { username: String, password: String },
    /// The access token lives in the refresh coordinator when a refresh token is present.
    OAuth {
        access_token: String,
        refresh_token: Option<String>,
        client_id: Option<String>,
        client_secret: Option<String>,
    },
    None,
}

impl AuthScheme {
    pub fn resolve(creds: &Map<String, Value>, options: &Map<String, Value>) -> Self {
        if let Some(key) = first_str(creds, &["apiKey", "api_key"]) {
            let header = first_str(options, &["apiKeyHeader"])
                .or_else(|| first_str(creds, &["apiKeyHeader"]))
                .unwrap_or(DEFAULT_API_KEY_HEADER);
            return AuthScheme::ApiKey {
                header: header.to_string(),
                value: key.to_string(),
            };
        }
        if let Some(token) = first_str(creds, &["token", "bearerToken"]) {
            return AuthScheme::Bearer(token.to_string());
        }
        if let (Some(username), Some(password)) = (
            first_str(creds, &["username", "user"]),
            first_str(creds, &["password"]),
        ) {
            return AuthScheme::Basic {
                username: username.to_string(),
                password: password.to_string(),
            };
        }
        if let Some(access_token) = first_str(creds, &["accessToken", "access_token"]) {
            return AuthScheme::OAuth {
                access_token: access_token.to_string(),
                refresh_token: first_str(creds, &["refreshToken", "refresh_token"]).map(str::to_string),
                client_id: first_str(creds, &["clientId", "client_id"]).map(str::to_string),
                client_secret: first_str(creds, &["clientSecret", "client_secret"]).map(str::to_string),
            };
        }
        AuthScheme::None
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuthScheme::ApiKey { .. } => "api_key",
            AuthScheme::Bearer(_) => "bearer",
            AuthScheme::Basic { .. } => "basic",
            AuthScheme::OAuth { .. } => "oauth",
            AuthScheme::None => "none",
        }
    }

    /// Adds the auth header. For OAuth, `oauth_token` overrides the initial token.
    pub fn apply(&self, request: RequestBuilder, oauth_token: Option<&str>) -> RequestBuilder {
        match self {
            AuthScheme::ApiKey { header, value } => request.header(header.as_str(), value.as_str()),
            AuthScheme::Bearer(token) => request.bearer_auth(token),
            AuthScheme::Basic { username, password } => request.basic_auth(username, Some(password)),
            AuthScheme::OAuth { access_token, .. } => {
                request.bearer_auth(oauth_token.unwrap_or(access_token.as_str()))
            }
            AuthScheme::None => request,
        }
    }
}

impl std::fmt::Debug for AuthScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthScheme::ApiKey { header, value } => write!(
                f,
                "ApiKey({}: {})",
                header,
                conduit::credentials::mask(value, 4)
            ),
            AuthScheme::OAuth { refresh_token, .. } => {
                write!(f, "OAuth(refreshable={})", refresh_token.is_some())
            }
            other => write!(f, "{}(..)", other.kind()),
        }
    }
}
