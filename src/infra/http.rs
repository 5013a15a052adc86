//! Reqwest-backed implementations of the transport and SSO seams.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::application::auth::{AuthClient, AuthError, TokenGrant};
use crate::application::executor::{
    HttpTransport, TransportError, UpstreamRequest, UpstreamResponse,
};

use super::error::InfraError;

const TARGET: &str = "esigate::http";

pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: &str, user_agent: &str, timeout: Duration) -> Result<Self, InfraError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::http(format!("failed to build http client: {err}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.client.get(&url).query(&request.query);
        if let Some(token) = &request.bearer_token {
            builder = builder.bearer_auth(token);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;

        let status = response.status().as_u16();
        // Reqwest header names are already lowercase; values that are not
        // valid UTF-8 are irrelevant to classification and dropped.
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        debug!(target: TARGET, %url, status, bytes = body.len(), "upstream response");
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(err.to_string())
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: u32,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

pub struct SsoAuthClient {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl SsoAuthClient {
    pub fn new(
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        timeout: Duration,
    ) -> Result<Self, InfraError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::http(format!("failed to build sso client: {err}")))?;

        Ok(Self {
            client,
            token_url: token_url.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }
}

#[async_trait]
impl AuthClient for SsoAuthClient {
    async fn refresh_grant(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|err| AuthError::Network(err.to_string()))?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            let grant: TokenResponse = response
                .json()
                .await
                .map_err(|err| AuthError::Network(format!("undecodable token response: {err}")))?;
            return Ok(TokenGrant {
                access_token: grant.access_token,
                refresh_token: grant.refresh_token,
                expires_in: grant.expires_in,
            });
        }

        // The SSO reports unusable refresh tokens as a 400 `invalid_grant`.
        if status == 400
            && let Ok(body) = response.json::<TokenErrorResponse>().await
            && body.error == "invalid_grant"
        {
            return Err(AuthError::InvalidGrant {
                message: body.error_description.unwrap_or(body.error),
            });
        }

        Err(AuthError::Upstream { status })
    }
}
