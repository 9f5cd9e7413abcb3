use crate::domain::gateway::{CorrelationId, GatewayReport, PushAccepted, PushRequest};
use crate::domain::ports::{PushGateway, StatusGateway};
use crate::error::{ConfirmError, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct CancelBody {
    cancelled: bool,
}

/// Gateway client speaking JSON over HTTP.
///
/// * `POST {base}/push` initiates a push.
/// * `GET {base}/push/{correlation}` queries its status.
/// * `POST {base}/push/{correlation}/cancel` withdraws it.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<&str>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ConfirmError::ConfigError(format!("invalid gateway token: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        let client = Client::builder()
            .user_agent("momo-confirm")
            .default_headers(headers)
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConfirmError::ConfigError(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

/// Maps a non-success response of the push endpoint to an error.
///
/// The gateway refusing the request (4xx) is a rejection; anything else means it
/// could not be asked.
fn push_failure(status: StatusCode, body: &str) -> ConfirmError {
    if status.is_client_error() {
        let reason = serde_json::from_str::<ErrorBody>(body)
            .map(|b| b.error)
            .unwrap_or_else(|_| body.trim().to_string());
        let reason = if reason.is_empty() {
            status.to_string()
        } else {
            reason
        };
        ConfirmError::GatewayRejected { reason }
    } else {
        ConfirmError::GatewayUnavailable(format!("push endpoint answered {status}"))
    }
}

#[async_trait]
impl PushGateway for HttpGateway {
    async fn initiate_push(&self, request: PushRequest) -> Result<PushAccepted> {
        let res = self
            .client
            .post(self.url("push"))
            .json(&request)
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(push_failure(status, &body));
        }
        let accepted = res.json::<PushAccepted>().await?;
        debug!(
            operation = %request.metadata.operation_id,
            correlation = ?accepted.correlation_id,
            "push accepted"
        );
        Ok(accepted)
    }

    async fn cancel_push(&self, correlation: &CorrelationId) -> Result<bool> {
        let res = self
            .client
            .post(self.url(&format!("push/{correlation}/cancel")))
            .send()
            .await?;
        let status = res.status();
        if status.is_client_error() {
            // Too late to cancel, or the gateway does not know the prompt.
            return Ok(false);
        }
        if !status.is_success() {
            return Err(ConfirmError::GatewayUnavailable(format!(
                "cancel endpoint answered {status}"
            )));
        }
        Ok(res.json::<CancelBody>().await?.cancelled)
    }
}

#[async_trait]
impl StatusGateway for HttpGateway {
    async fn query(&self, correlation: &CorrelationId) -> Result<GatewayReport> {
        let res = self
            .client
            .get(self.url(&format!("push/{correlation}")))
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            return Err(ConfirmError::GatewayUnavailable(format!(
                "status endpoint answered {status}"
            )));
        }
        Ok(res.json::<GatewayReport>().await?)
    }
}
