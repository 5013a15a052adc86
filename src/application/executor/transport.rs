//! Transport seam between the executor and the actual HTTP stack.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
}

/// An outbound upstream request, already reduced to what the wire needs.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub path: String,
    pub query: Vec<(String, String)>,
    /// Extra headers such as `if-none-match`.
    pub headers: Vec<(String, String)>,
    pub bearer_token: Option<String>,
}

/// A raw upstream response. Header names are lowercased by the transport so
/// classification never has to worry about case.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl UpstreamResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn header_u32(&self, name: &str) -> Option<u32> {
        self.header(name)?.trim().parse().ok()
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, TransportError>;
}
