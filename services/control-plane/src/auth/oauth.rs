//! OAuth 2.0 authorization-code login for Google and GitHub

use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::config::Settings;

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("OAuth provider {0} is not configured")]
    NotConfigured(String),

    #[error("unknown OAuth provider: {0}")]
    UnknownProvider(String),

    #[error("OAuth HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OAuth provider returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("no verified email on the OAuth account")]
    MissingEmail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Google,
    Github,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Google => "google",
            ProviderKind::Github => "github",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = OAuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "google" => Ok(ProviderKind::Google),
            "github" => Ok(ProviderKind::Github),
            other => Err(OAuthError::UnknownProvider(other.to_string())),
        }
    }
}

/// Identity returned by a provider
#[derive(Debug, Clone, PartialEq)]
pub struct OAuthProfile {
    pub subject: String,
    pub email: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OAuthProvider {
    pub kind: ProviderKind,
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    authorize_endpoint: String,
    token_endpoint: String,
    userinfo_endpoint: String,
    /// GitHub only: fallback when the profile email is private
    emails_endpoint: Option<String>,
}

impl OAuthProvider {
    pub fn google(client_id: &str, client_secret: &str, redirect_uri: &str) -> Self {
        Self {
            kind: ProviderKind::Google,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_uri: redirect_uri.to_string(),
            authorize_endpoint: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_endpoint: "https://oauth2.googleapis.com/token".to_string(),
            userinfo_endpoint: "https://openidconnect.googleapis.com/v1/userinfo".to_string(),
            emails_endpoint: None,
        }
    }

    pub fn github(client_id: &str, client_secret: &str, redirect_uri: &str) -> Self {
        Self {
            kind: ProviderKind::Github,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_uri: redirect_uri.to_string(),
            authorize_endpoint: "https://github.com/login/oauth/authorize".to_string(),
            token_endpoint: "https://github.com/login/oauth/access_token".to_string(),
            userinfo_endpoint: "https://api.github.com/user".to_string(),
            emails_endpoint: Some("https://api.github.com/user/emails".to_string()),
        }
    }

    /// Point token and profile calls at another host (used by tests)
    pub fn with_api_base(mut self, base: &str) -> Self {
        let base = base.trim_end_matches('/');
        self.token_endpoint = format!("{}/token", base);
        self.userinfo_endpoint = format!("{}/userinfo", base);
        if self.emails_endpoint.is_some() {
            self.emails_endpoint = Some(format!("{}/emails", base));
        }
        self
    }

    fn scope(&self) -> &'static str {
        match self.kind {
            ProviderKind::Google => "openid email profile",
            ProviderKind::Github => "read:user user:email",
        }
    }

    pub fn authorize_url(&self, state: &str) -> Result<String, OAuthError> {
        let url = Url::parse_with_params(
            &self.authorize_endpoint,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("response_type", "code"),
                ("scope", self.scope()),
                ("state", state),
            ],
        )
        .map_err(|e| OAuthError::InvalidResponse(e.to_string()))?;
        Ok(url.to_string())
    }

    /// Exchange an authorization code for a provider access token
    pub async fn exchange_code(&self, http: &Client, code: &str) -> Result<String, OAuthError> {
        let response = http
            .post(&self.token_endpoint)
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await?;

        let status = response.status();
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| OAuthError::InvalidResponse(format!("token response: {}", e)))?;

        match body.access_token {
            Some(token) if status.is_success() => Ok(token),
            _ => Err(OAuthError::InvalidResponse(format!(
                "token exchange failed ({}): {}",
                status,
                body.error.unwrap_or_default()
            ))),
        }
    }

    pub async fn fetch_profile(
        &self,
        http: &Client,
        access_token: &str,
    ) -> Result<OAuthProfile, OAuthError> {
        let response = http
            .get(&self.userinfo_endpoint)
            .bearer_auth(access_token)
            .header("User-Agent", "bot-marketplace")
            .header("Accept", "application/json")
            .send()
            .await?
            .error_for_status()?;

        match self.kind {
            ProviderKind::Google => {
                let info: GoogleUserInfo = response
                    .json()
                    .await
                    .map_err(|e| OAuthError::InvalidResponse(e.to_string()))?;
                let email = info
                    .email
                    .filter(|_| info.email_verified.unwrap_or(true))
                    .ok_or(OAuthError::MissingEmail)?;
                Ok(OAuthProfile {
                    subject: info.sub,
                    email,
                    display_name: info.name,
                })
            }
            ProviderKind::Github => {
                let user: GithubUser = response
                    .json()
                    .await
                    .map_err(|e| OAuthError::InvalidResponse(e.to_string()))?;
                let email = match user.email {
                    Some(email) => email,
                    None => self.github_primary_email(http, access_token).await?,
                };
                Ok(OAuthProfile {
                    subject: user.id.to_string(),
                    email,
                    display_name: user.name.or(Some(user.login)),
                })
            }
        }
    }

    async fn github_primary_email(
        &self,
        http: &Client,
        access_token: &str,
    ) -> Result<String, OAuthError> {
        let endpoint = self.emails_endpoint.as_ref().ok_or(OAuthError::MissingEmail)?;
        let emails: Vec<GithubEmail> = http
            .get(endpoint)
            .bearer_auth(access_token)
            .header("User-Agent", "bot-marketplace")
            .header("Accept", "application/json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .map_err(|e| OAuthError::InvalidResponse(e.to_string()))?;

        emails
            .into_iter()
            .find(|e| e.primary && e.verified)
            .map(|e| e.email)
            .ok_or(OAuthError::MissingEmail)
    }
}

/// Configured providers plus a shared HTTP client
#[derive(Debug, Clone)]
pub struct OAuthRegistry {
    providers: HashMap<ProviderKind, OAuthProvider>,
    http: Client,
}

impl OAuthRegistry {
    pub fn new(providers: Vec<OAuthProvider>) -> anyhow::Result<Self> {
        let http = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            providers: providers.into_iter().map(|p| (p.kind, p)).collect(),
            http,
        })
    }

    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let mut providers = Vec::new();
        if let (Some(id), Some(secret), Some(redirect)) = (
            &settings.oauth_google_client_id,
            &settings.oauth_google_client_secret,
            &settings.oauth_google_redirect_uri,
        ) {
            providers.push(OAuthProvider::google(id, secret, redirect));
        }
        if let (Some(id), Some(secret), Some(redirect)) = (
            &settings.oauth_github_client_id,
            &settings.oauth_github_client_secret,
            &settings.oauth_github_redirect_uri,
        ) {
            providers.push(OAuthProvider::github(id, secret, redirect));
        }
        Self::new(providers)
    }

    pub fn get(&self, kind: ProviderKind) -> Result<&OAuthProvider, OAuthError> {
        self.providers
            .get(&kind)
            .ok_or_else(|| OAuthError::NotConfigured(kind.to_string()))
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn configured(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.providers.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleUserInfo {
    sub: String,
    email: Option<String>,
    email_verified: Option<bool>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubUser {
    id: u64,
    login: String,
    name: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GithubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_authorize_url_contains_state() {
        let provider = OAuthProvider::google("cid", "secret", "https://app.example.com/cb");
        let url = provider.authorize_url("abc.def").unwrap();
        assert!(url.starts_with("https://accounts.google.com/o/oauth2/v2/auth?"));
        assert!(url.contains("client_id=cid"));
        assert!(url.contains("state=abc.def"));
        assert!(url.contains("response_type=code"));
    }

    #[test]
    fn test_provider_parsing() {
        assert_eq!("GitHub".parse::<ProviderKind>().unwrap(), ProviderKind::Github);
        assert!("facebook".parse::<ProviderKind>().is_err());
    }

    #[tokio::test]
    async fn test_github_login_falls_back_to_primary_email() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code=the-code"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"access_token": "gho_123"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/userinfo"))
            .and(header("Authorization", "Bearer gho_123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 777, "login": "octo", "name": null, "email": null
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/emails"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"email": "old@example.com", "primary": false, "verified": true},
                {"email": "octo@example.com", "primary": true, "verified": true}
            ])))
            .mount(&server)
            .await;

        let provider =
            OAuthProvider::github("cid", "secret", "https://app/cb").with_api_base(&server.uri());
        let http = Client::new();
        let token = provider.exchange_code(&http, "the-code").await.unwrap();
        let profile = provider.fetch_profile(&http, &token).await.unwrap();

        assert_eq!(profile.subject, "777");
        assert_eq!(profile.email, "octo@example.com");
        assert_eq!(profile.display_name.as_deref(), Some("octo"));
    }

    #[tokio::test]
    async fn test_token_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;

        let provider = OAuthProvider::google("cid", "secret", "https://app/cb")
            .with_api_base(&server.uri());
        let err = provider
            .exchange_code(&Client::new(), "bad")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid_grant"));
    }
}
