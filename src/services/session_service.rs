//! Client for the external session service.
//!
//! The proxy never mints or validates identity credentials itself: it
//! exchanges the client's identity token for an authorization grant,
//! and later exchanges the server authorization grant the client hands
//! back for a server access token. Both calls are plain HTTPS RPCs
//! against the configured service.

use log::error;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Timeout applied to every session service request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur while talking to the session service. Every
/// variant disconnects the affected session.
#[derive(Debug, Error)]
pub enum SessionServiceError {
    /// The service could not be reached or timed out
    #[error("session service unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    /// The service refused the request
    #[error("session service denied the request: {0}")]
    Denied(String),
}

/// Async RPC-style client for the session service
pub struct SessionService {
    http: reqwest::Client,
    base_url: String,
}

/// Response to a grant request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantResponse {
    pub authorization_grant: String,
    pub server_identity_token: String,
}

/// Response to a grant exchange
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeResponse {
    pub server_access_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GrantRequest<'a> {
    uuid: Uuid,
    username: &'a str,
    identity_token: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeRequest<'a> {
    authorization_grant: &'a str,
}

impl SessionService {
    pub fn new(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create session service client");
        Self { http, base_url }
    }

    /// Requests an authorization grant for a connecting player
    pub async fn request_grant(
        &self,
        uuid: Uuid,
        username: &str,
        identity_token: &str,
    ) -> Result<GrantResponse, SessionServiceError> {
        let url = format!("{}/v1/grants", self.base_url);
        let response = self
            .http
            .post(url)
            .json(&GrantRequest {
                uuid,
                username,
                identity_token,
            })
            .send()
            .await?;

        Self::parse(response).await
    }

    /// Exchanges a server authorization grant for a server access token
    pub async fn exchange_grant(
        &self,
        authorization_grant: &str,
    ) -> Result<ExchangeResponse, SessionServiceError> {
        let url = format!("{}/v1/grants/exchange", self.base_url);
        let response = self
            .http
            .post(url)
            .json(&ExchangeRequest {
                authorization_grant,
            })
            .send()
            .await?;

        Self::parse(response).await
    }

    async fn parse<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, SessionServiceError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Session service rejected request ({}): {}", status, body);
            return Err(SessionServiceError::Denied(format!(
                "{} {}",
                status, body
            )));
        }
        Ok(response.json().await?)
    }
}
