//! HTTP client for the subscription/management API: fetching node info and
//! the user roster, and pushing traffic reports.
//!
//! Grounded on `stealth.rs`'s DoH client for the `reqwest::Client` usage
//! pattern (bearer auth header, `.json()` response decoding) and on
//! `internal/app/service/users.go`'s three calls this replaces
//! (`GetNodeInfo`, `GetUserList`, `ReportUserTraffic`).

use crate::config::NodeInfo;
use crate::error::ApiError;
use crate::registry::{User, UserTraffic};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Everything the server needs from the control-plane API. A trait so tests
/// can substitute a fixture without a live HTTP server.
#[async_trait]
pub trait SubscriptionApi: Send + Sync {
    async fn get_node_info(&self) -> Result<NodeInfo, ApiError>;
    async fn get_user_list(&self) -> Result<Vec<User>, ApiError>;
    async fn report_user_traffic(&self, traffics: &[UserTraffic]) -> Result<(), ApiError>;
}

/// `reqwest`-backed implementation talking to a panda-style management API.
pub struct HttpApiClient {
    client: Client,
    base_url: String,
    token: String,
    node_id: String,
}

impl HttpApiClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, node_id: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client with no custom TLS config should always build");
        HttpApiClient {
            client,
            base_url: base_url.into(),
            token: token.into(),
            node_id: node_id.into(),
        }
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(ApiError::Status { status, body })
        }
    }
}

#[async_trait]
impl SubscriptionApi for HttpApiClient {
    async fn get_node_info(&self) -> Result<NodeInfo, ApiError> {
        let url = format!("{}/config", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("node_id", self.node_id.as_str()), ("node_type", "hysteria")])
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        Ok(resp.json::<NodeInfo>().await?)
    }

    async fn get_user_list(&self) -> Result<Vec<User>, ApiError> {
        let url = format!("{}/users", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("node_id", &self.node_id)])
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        Ok(resp.json::<Vec<User>>().await?)
    }

    async fn report_user_traffic(&self, traffics: &[UserTraffic]) -> Result<(), ApiError> {
        if traffics.is_empty() {
            return Ok(());
        }
        let url = format!("{}/push/traffic", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .query(&[("node_id", &self.node_id)])
            .json(traffics)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }
}
