//! Vultr API Client for the Kubernetes Engine endpoints

use crate::poller::RemoteError;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "https://api.vultr.com";

/// Client errors
///
/// Classification is driven by the HTTP status of the response, never by the
/// wording of the error body.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("API authorization error: {0}")]
    Unauthorized(String),
    #[error("Resource not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid client configuration: {0}")]
    InvalidConfig(String),
}

impl RemoteError for ClientError {
    fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Error body returned by the Vultr API
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: String,
}

/// Vultr API Client
#[derive(Clone)]
pub struct VultrClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl std::fmt::Debug for VultrClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VultrClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl VultrClient {
    /// Create a new client against `endpoint` (e.g. https://api.vultr.com)
    pub fn new(endpoint: &str, api_key: &str) -> Result<Self> {
        if api_key.is_empty() {
            return Err(ClientError::InvalidConfig("api_key must not be empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("terraform-provider-vultr/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: format!("{}/v2", endpoint.trim_end_matches('/')),
            api_key: api_key.to_string(),
        })
    }

    /// Build headers for requests
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.api_key)) {
            headers.insert(AUTHORIZATION, value);
        }

        headers
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET request
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .headers(self.headers())
            .send()
            .await?;

        let body = Self::check(response).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// POST request
    async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .post(self.url(path))
            .headers(self.headers())
            .json(body)
            .send()
            .await?;

        let body = Self::check(response).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// PUT request, the API answers with 204
    async fn put<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let response = self
            .client
            .put(self.url(path))
            .headers(self.headers())
            .json(body)
            .send()
            .await?;

        Self::check(response).await.map(|_| ())
    }

    /// PATCH request
    async fn patch<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T> {
        let response = self
            .client
            .patch(self.url(path))
            .headers(self.headers())
            .json(body)
            .send()
            .await?;

        let body = Self::check(response).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// DELETE request
    async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.url(path))
            .headers(self.headers())
            .send()
            .await?;

        Self::check(response).await.map(|_| ())
    }

    /// Map the response status to an error, or return the body
    async fn check(response: reqwest::Response) -> Result<String> {
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return Ok(body);
        }

        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body);

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientError::Unauthorized(message),
            StatusCode::NOT_FOUND => ClientError::NotFound(message),
            _ => ClientError::Api {
                status: status.as_u16(),
                message,
            },
        })
    }
}

// ============================================================================
// API Data Types
// ============================================================================

/// VKE cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub date_created: String,
    #[serde(default)]
    pub cluster_subnet: String,
    #[serde(default)]
    pub service_subnet: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub node_pools: Vec<NodePool>,
}

/// Node pool within a cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePool {
    pub id: String,
    #[serde(default)]
    pub date_created: String,
    #[serde(default)]
    pub date_updated: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub node_quantity: u32,
    #[serde(default)]
    pub min_nodes: u32,
    #[serde(default)]
    pub max_nodes: u32,
    #[serde(default)]
    pub auto_scaler: bool,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

/// Instance backing a node pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default)]
    pub date_created: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub status: String,
}

/// Create cluster request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterReq {
    pub label: String,
    pub region: String,
    pub version: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub node_pools: Vec<NodePoolReq>,
}

/// Update cluster request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterReqUpdate {
    pub label: String,
}

/// Create node pool request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodePoolReq {
    pub node_quantity: u32,
    pub label: String,
    pub plan: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_scaler: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_nodes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_nodes: Option<u32>,
}

/// Update node pool request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePoolReqUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_quantity: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_scaler: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_nodes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_nodes: Option<u32>,
}

/// Base64 encoded kubeconfig
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeConfig {
    pub kube_config: String,
}

#[derive(Deserialize)]
struct ClusterEnvelope {
    vke_cluster: Cluster,
}

#[derive(Deserialize)]
struct NodePoolEnvelope {
    node_pool: NodePool,
}

// ============================================================================
// API Methods
// ============================================================================

impl VultrClient {
    pub async fn create_cluster(&self, request: &ClusterReq) -> Result<Cluster> {
        let envelope: ClusterEnvelope = self.post("/kubernetes/clusters", request).await?;
        Ok(envelope.vke_cluster)
    }

    pub async fn get_cluster(&self, id: &str) -> Result<Cluster> {
        let envelope: ClusterEnvelope = self
            .get(&format!("/kubernetes/clusters/{}", id))
            .await?;
        Ok(envelope.vke_cluster)
    }

    pub async fn update_cluster(&self, id: &str, request: &ClusterReqUpdate) -> Result<()> {
        self.put(&format!("/kubernetes/clusters/{}", id), request)
            .await
    }

    pub async fn delete_cluster(&self, id: &str) -> Result<()> {
        self.delete(&format!("/kubernetes/clusters/{}", id)).await
    }

    pub async fn get_kube_config(&self, id: &str) -> Result<KubeConfig> {
        self.get(&format!("/kubernetes/clusters/{}/config", id))
            .await
    }

    // Node pool operations
    pub async fn create_node_pool(&self, cluster_id: &str, request: &NodePoolReq) -> Result<NodePool> {
        let envelope: NodePoolEnvelope = self
            .post(&format!("/kubernetes/clusters/{}/node-pools", cluster_id), request)
            .await?;
        Ok(envelope.node_pool)
    }

    pub async fn update_node_pool(
        &self,
        cluster_id: &str,
        node_pool_id: &str,
        request: &NodePoolReqUpdate,
    ) -> Result<NodePool> {
        let envelope: NodePoolEnvelope = self
            .patch(
                &format!("/kubernetes/clusters/{}/node-pools/{}", cluster_id, node_pool_id),
                request,
            )
            .await?;
        Ok(envelope.node_pool)
    }

    pub async fn delete_node_pool(&self, cluster_id: &str, node_pool_id: &str) -> Result<()> {
        self.delete(&format!(
            "/kubernetes/clusters/{}/node-pools/{}",
            cluster_id, node_pool_id
        ))
        .await
    }
}
