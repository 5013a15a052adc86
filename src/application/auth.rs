//! SSO token refresh and credential-encryption seams.
//!
//! The gateway never stores plaintext refresh tokens. Encryption lives
//! behind `TokenCipher` so the key-management side can be swapped without
//! touching the refresh pipeline.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    /// The refresh token was revoked or is otherwise unusable. The owner
    /// must re-authorize; retrying cannot help.
    #[error("refresh grant rejected: {message}")]
    InvalidGrant { message: String },
    #[error("sso upstream error {status}")]
    Upstream { status: u16 },
    #[error("network failure reaching sso: {0}")]
    Network(String),
}

#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    /// Access-token lifetime in seconds.
    pub expires_in: u32,
}

#[async_trait]
pub trait AuthClient: Send + Sync {
    /// Exchange a refresh token for a new access/refresh token pair.
    async fn refresh_grant(&self, refresh_token: &str) -> Result<TokenGrant, AuthError>;
}

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("cipher failure: {0}")]
    Failed(String),
}

pub trait TokenCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError>;
}

/// Identity cipher for deployments where encryption is handled by an
/// external layer (encrypted volume, vault sidecar).
pub struct PassthroughCipher;

impl TokenCipher for PassthroughCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        Ok(ciphertext.to_string())
    }
}
