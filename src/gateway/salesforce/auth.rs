use reqwest::Client;
use serde::Deserialize;

use crate::config::SalesforceConfig;
use crate::error::{AppError, Result};

/// An authenticated Salesforce session.
#[derive(Debug, Clone)]
pub struct Session {
    pub access_token: String,
    pub instance_url: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl Session {
    /// Sessions are refreshed a minute before they expire.
    pub fn is_fresh(&self) -> bool {
        self.expires_at > chrono::Utc::now() + chrono::Duration::minutes(1)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    instance_url: String,
}

fn token_form(config: &SalesforceConfig) -> String {
    let password = format!("{}{}", config.password, config.security_token);
    [
        ("grant_type", "password"),
        ("client_id", config.client_id.as_str()),
        ("client_secret", config.client_secret.as_str()),
        ("username", config.username.as_str()),
        ("password", password.as_str()),
    ]
    .iter()
    .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
    .collect::<Vec<_>>()
    .join("&")
}

/// Obtain an access token with the OAuth 2.0 username-password flow.
pub async fn request_session(http: &Client, config: &SalesforceConfig) -> Result<Session> {
    let url = format!(
        "{}/services/oauth2/token",
        config.login_url.trim_end_matches('/')
    );

    let response = http
        .post(&url)
        .header("content-type", "application/x-www-form-urlencoded")
        .body(token_form(config))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AppError::Salesforce(format!(
            "token request returned {status}: {body}"
        )));
    }

    let token: TokenResponse = response.json().await?;

    tracing::info!(instance_url = %token.instance_url, "Authenticated with Salesforce");

    Ok(Session {
        access_token: token.access_token,
        instance_url: token.instance_url.trim_end_matches('/').to_string(),
        expires_at: chrono::Utc::now()
            + chrono::Duration::seconds(config.token_ttl_secs as i64),
    })
}
