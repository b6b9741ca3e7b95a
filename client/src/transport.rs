use async_trait::async_trait;
use delivery_api::{ErrorBody, ErrorCode, SendRequest, SendResponse};
use std::time::Duration;

use crate::store::QueuedMessage;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The server could not be reached or the connection dropped mid-request.
    #[error("server unreachable: {0}")]
    Connectivity(String),
    /// The server answered with a non-success status.
    #[error("server rejected message with status {status}")]
    Rejected { status: u16, code: Option<ErrorCode> },
}

impl TransportError {
    /// The server refused the message for a reason a resend cannot fix
    /// (validation or entitlement). Connectivity failures, storage outages,
    /// rejections without an error body and expired credentials are not
    /// permanent.
    pub fn is_permanent(&self) -> bool {
        match self {
            TransportError::Connectivity(_) => false,
            TransportError::Rejected { code: Some(code), .. } => {
                !code.is_retryable() && *code != ErrorCode::Unauthorized
            }
            TransportError::Rejected { code: None, .. } => false,
        }
    }
}

/// Hands one queued message to the dispatcher.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &QueuedMessage) -> Result<SendResponse, TransportError>;
}

/// Transport posting to the server's REST send endpoint.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, message: &QueuedMessage) -> Result<SendResponse, TransportError> {
        let req = SendRequest {
            conversation_id: message.conversation_id,
            text: message.text.clone(),
            client_temp_id: Some(message.client_temp_id.clone()),
        };
        let resp = self
            .client
            .post(format!("{}/api/messages", self.base_url))
            .bearer_auth(&self.token)
            .json(&req)
            .send()
            .await
            .map_err(|e| TransportError::Connectivity(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let code = resp.json::<ErrorBody>().await.ok().map(|b| b.code);
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                code,
            });
        }
        resp.json::<SendResponse>()
            .await
            .map_err(|e| TransportError::Connectivity(e.to_string()))
    }
}
