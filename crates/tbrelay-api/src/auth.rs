// Credential exchange
//
// Username/password pairs are traded for a JWT pair at the platform's
// login endpoint; pre-issued token pairs skip the exchange. Refresh tokens
// are traded for a fresh pair when the session reconnects.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::error::Error;

const LOGIN_PATH: &str = "/api/auth/login";
const REFRESH_PATH: &str = "/api/auth/token";

/// A JWT access token plus the optional refresh token issued with it.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub token: SecretString,
    pub refresh_token: Option<SecretString>,
}

impl TokenPair {
    pub fn new(token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            refresh_token: refresh_token.map(SecretString::from),
        }
    }
}

/// Credentials for authenticating the upstream session.
///
/// Each variant carries the secret material needed for its auth flow.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Exchanged for a token pair at the login endpoint.
    UsernamePassword {
        username: String,
        password: SecretString,
    },
    /// Pre-issued tokens; no exchange needed.
    TokenPair(TokenPair),
}

impl Credentials {
    pub fn username_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::UsernamePassword {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }
}

/// Body of a successful login or refresh response.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
    token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Derive the login endpoint from the telemetry WebSocket URL.
///
/// `wss://host/api/ws` becomes `https://host/api/auth/login`.
pub fn login_url_for(ws_url: &Url) -> Result<Url, Error> {
    let mut url = ws_url.clone();
    let scheme = match ws_url.scheme() {
        "wss" | "https" => "https",
        _ => "http",
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::WebSocketConnect(format!("cannot derive login URL from {ws_url}")))?;
    url.set_query(None);
    url.set_fragment(None);
    url.set_path(LOGIN_PATH);
    Ok(url)
}

/// HTTP client for the login and token refresh endpoints.
pub struct AuthClient {
    http: reqwest::Client,
    login_url: Url,
}

impl AuthClient {
    pub fn new(http: reqwest::Client, login_url: Url) -> Self {
        Self { http, login_url }
    }

    /// The login endpoint this client posts to.
    pub fn login_url(&self) -> &Url {
        &self.login_url
    }

    /// Exchange username/password for a token pair.
    ///
    /// Any non-200 response is a hard authentication failure.
    pub async fn login(&self, username: &str, password: &SecretString) -> Result<TokenPair, Error> {
        debug!("logging in at {}", self.login_url);

        let body = json!({
            "username": username,
            "password": password.expose_secret(),
        });

        let resp = self
            .http
            .post(self.login_url.clone())
            .json(&body)
            .send()
            .await
            .map_err(Error::Transport)?;

        let pair = parse_token_response(resp, "login").await?;
        debug!("login successful");
        Ok(pair)
    }

    /// Trade a refresh token for a new token pair.
    pub async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenPair, Error> {
        let url = self.login_url.join(REFRESH_PATH)?;
        debug!("refreshing token at {}", url);

        let resp = self
            .http
            .post(url)
            .json(&json!({ "refreshToken": refresh_token.expose_secret() }))
            .send()
            .await
            .map_err(Error::Transport)?;

        parse_token_response(resp, "token refresh").await
    }
}

async fn parse_token_response(resp: reqwest::Response, what: &str) -> Result<TokenPair, Error> {
    let status = resp.status();
    if status != reqwest::StatusCode::OK {
        let body = resp.text().await.unwrap_or_default();
        let preview: String = body.chars().take(200).collect();
        return Err(Error::BadCredentials {
            message: format!("{what} failed (HTTP {status}): {preview}"),
        });
    }

    let body = resp.text().await.map_err(Error::Transport)?;
    let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| Error::Deserialization {
        message: format!("{what} response: {e}"),
        body: body.clone(),
    })?;

    Ok(TokenPair::new(parsed.token, parsed.refresh_token))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn login_url_from_secure_socket() {
        let ws = Url::parse("wss://demo.thingsboard.io/api/ws/plugins/telemetry?token=x").unwrap();
        assert_eq!(
            login_url_for(&ws).unwrap().as_str(),
            "https://demo.thingsboard.io/api/auth/login"
        );
    }

    #[test]
    fn login_url_keeps_port_for_plain_socket() {
        let ws = Url::parse("ws://localhost:8080/api/ws").unwrap();
        assert_eq!(
            login_url_for(&ws).unwrap().as_str(),
            "http://localhost:8080/api/auth/login"
        );
    }

    #[test]
    fn token_pair_keeps_optional_refresh() {
        let pair = TokenPair::new("a", None);
        assert_eq!(pair.token.expose_secret(), "a");
        assert!(pair.refresh_token.is_none());
    }
}
