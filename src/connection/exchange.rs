//! OAuth-style credential exchange over HTTP.

use super::auth::{CredentialExchange, Credentials, Token};
use crate::error::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// Path of the token endpoint below the login URL.
pub const TOKEN_PATH: &str = "/services/oauth2/token";

/// Exchanges credentials at `{login_url}/services/oauth2/token`.
#[derive(Debug, Clone)]
pub struct HttpCredentialExchange {
    client: Client,
    token_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    instance_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default, rename = "error_description")]
    error_description: Option<String>,
}

impl HttpCredentialExchange {
    /// Create an exchange against the given login URL.
    pub fn new(login_url: &str, timeout: Duration) -> Result<Self, AuthError> {
        let login_url = login_url.trim_end_matches('/');
        if !(login_url.starts_with("https://") || login_url.starts_with("http://")) {
            return Err(AuthError::MissingCredentials(format!(
                "login URL '{}' must be an http(s) URL",
                login_url
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::ExchangeFailed(e.to_string()))?;

        Ok(Self {
            client,
            token_url: format!("{}{}", login_url, TOKEN_PATH),
        })
    }

    /// Full URL of the token endpoint.
    pub fn token_url(&self) -> &str {
        &self.token_url
    }
}

#[async_trait]
impl CredentialExchange for HttpCredentialExchange {
    async fn exchange(&self, credentials: &Credentials) -> Result<Token, AuthError> {
        let mut form = vec![
            ("grant_type", credentials.grant_type()),
            ("client_id", credentials.client_id()),
            ("client_secret", credentials.client_secret()),
        ];
        if let (Some(username), Some(password)) = (credentials.username(), credentials.password()) {
            form.push(("username", username));
            form.push(("password", password));
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| AuthError::ExchangeFailed(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| AuthError::ExchangeFailed(e.to_string()))?;
        parse_exchange_response(status, &body)
    }
}

/// Turn a token endpoint response into a token or a classified error.
fn parse_exchange_response(status: u16, body: &[u8]) -> Result<Token, AuthError> {
    if status >= 500 || status == 429 {
        return Err(AuthError::ExchangeFailed(format!(
            "token endpoint returned HTTP {}",
            status
        )));
    }

    let parsed: Result<ExchangeResponse, _> = serde_json::from_slice(body);

    if !(200..300).contains(&status) {
        let (code, description) = match parsed {
            Ok(ExchangeResponse {
                error: Some(code),
                error_description,
                ..
            }) => (code, error_description.unwrap_or_default()),
            _ => (
                format!("http_{}", status),
                String::from_utf8_lossy(body).into_owned(),
            ),
        };
        return Err(AuthError::Rejected { code, description });
    }

    let response = parsed.map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
    if let Some(code) = response.error {
        return Err(AuthError::Rejected {
            code,
            description: response.error_description.unwrap_or_default(),
        });
    }

    let access_token = response
        .token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthError::InvalidResponse("response has no token".to_string()))?;
    let expires_at = response
        .expires_at
        .ok_or_else(|| AuthError::InvalidResponse("response has no expiresAt".to_string()))?;

    let token = Token::new(
        response.token_type.unwrap_or_else(|| "Bearer".to_string()),
        access_token,
        expires_at,
    );
    Ok(match response.instance_url {
        Some(url) => token.with_instance_url(url),
        None => token,
    })
}
