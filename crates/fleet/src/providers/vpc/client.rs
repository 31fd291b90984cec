//! VPC compute, global tagging and global search API clients.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, warn};

use super::auth::IamAuthenticator;
use super::models::{
    ActionRequest, ApiErrorBody, FloatingIpCollection, InstanceCollection, SearchRequest,
    SearchResponse, TagList, TagRequest, TagResource, TagResults,
};
use crate::clients::ClientFactory;
use crate::config::ProviderConfig;
use crate::providers::{
    BackendError, ComputeApi, FloatingIp, FloatingIpPrototype, Instance, InstanceAction,
    InstancePrototype, SearchApi, SearchItem, TaggingApi,
};

/// VPC API version date sent with every compute request.
pub const API_VERSION: &str = "2021-01-19";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Query parameters required by every VPC call.
const VPC_PARAMS: [(&str, &str); 2] = [("version", API_VERSION), ("generation", "2")];

/// Map an error response to a [`BackendError`].
pub(crate) fn classify(status: StatusCode, body: &str) -> BackendError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|b| b.errors.into_iter().next())
        .map_or_else(|| body.to_string(), |e| e.message);
    let lowered = message.to_lowercase();

    match status {
        StatusCode::NOT_FOUND => BackendError::NotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Auth(message),
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT if lowered.contains("already exists") => {
            BackendError::AlreadyExists(message)
        }
        StatusCode::BAD_REQUEST if lowered.contains("over quota") => {
            BackendError::QuotaExceeded(message)
        }
        _ => BackendError::Api {
            status: status.as_u16(),
            message,
        },
    }
}

/// Authenticated HTTP transport shared by the three clients.
#[derive(Debug, Clone)]
struct Transport {
    client: Client,
    auth: Arc<IamAuthenticator>,
}

impl Transport {
    fn new(auth: Arc<IamAuthenticator>) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;
        Ok(Self { client, auth })
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, BackendError> {
        let token = self.auth.token().await?;
        Ok(request
            .bearer_auth(token)
            .header("Accept", "application/json")
            .send()
            .await?)
    }

    async fn json<T: serde::de::DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, BackendError> {
        let response = self.send(request).await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                BackendError::Serialization(e)
            })
        } else {
            Err(classify(status, &text))
        }
    }

    async fn empty(&self, request: RequestBuilder) -> Result<(), BackendError> {
        let response = self.send(request).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(classify(status, &text))
        }
    }
}

// ============================================================================
// Compute
// ============================================================================

/// VPC Gen2 compute client.
#[derive(Debug, Clone)]
pub struct VpcClient {
    transport: Transport,
    base_url: String,
}

impl VpcClient {
    /// Create a client for the regional VPC `endpoint`.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(endpoint: &str, auth: Arc<IamAuthenticator>) -> Result<Self, BackendError> {
        Ok(Self {
            transport: Transport::new(auth)?,
            base_url: format!("{}/v1", endpoint.trim_end_matches('/')),
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, method = %method, "VPC request");
        self.transport
            .client
            .request(method, &url)
            .query(&VPC_PARAMS)
    }
}

#[async_trait]
impl ComputeApi for VpcClient {
    async fn create_instance(
        &self,
        prototype: &InstancePrototype,
    ) -> Result<Instance, BackendError> {
        let request = self.request(reqwest::Method::POST, "/instances").json(prototype);
        self.transport.json(request).await
    }

    async fn get_instance(&self, id: &str) -> Result<Instance, BackendError> {
        let request = self.request(reqwest::Method::GET, &format!("/instances/{id}"));
        self.transport.json(request).await
    }

    async fn find_instance_by_name(&self, name: &str) -> Result<Option<Instance>, BackendError> {
        let request = self
            .request(reqwest::Method::GET, "/instances")
            .query(&[("name", name)]);
        let collection: InstanceCollection = self.transport.json(request).await?;
        Ok(collection.instances.into_iter().find(|i| i.name == name))
    }

    async fn delete_instance(&self, id: &str) -> Result<(), BackendError> {
        let request = self.request(reqwest::Method::DELETE, &format!("/instances/{id}"));
        self.transport.empty(request).await
    }

    async fn instance_action(&self, id: &str, action: InstanceAction) -> Result<(), BackendError> {
        let request = self
            .request(reqwest::Method::POST, &format!("/instances/{id}/actions"))
            .json(&ActionRequest { action });
        self.transport.empty(request).await
    }

    async fn list_floating_ips(&self) -> Result<Vec<FloatingIp>, BackendError> {
        let request = self.request(reqwest::Method::GET, "/floating_ips");
        let collection: FloatingIpCollection = self.transport.json(request).await?;
        Ok(collection.floating_ips)
    }

    async fn create_floating_ip(
        &self,
        prototype: &FloatingIpPrototype,
    ) -> Result<FloatingIp, BackendError> {
        let request = self
            .request(reqwest::Method::POST, "/floating_ips")
            .json(prototype);
        self.transport.json(request).await
    }

    async fn delete_floating_ip(&self, id: &str) -> Result<(), BackendError> {
        let request = self.request(reqwest::Method::DELETE, &format!("/floating_ips/{id}"));
        self.transport.empty(request).await
    }

    async fn list_interface_floating_ips(
        &self,
        instance_id: &str,
        interface_id: &str,
    ) -> Result<Vec<FloatingIp>, BackendError> {
        let request = self.request(
            reqwest::Method::GET,
            &format!("/instances/{instance_id}/network_interfaces/{interface_id}/floating_ips"),
        );
        let collection: FloatingIpCollection = self.transport.json(request).await?;
        Ok(collection.floating_ips)
    }

    async fn attach_floating_ip(
        &self,
        instance_id: &str,
        interface_id: &str,
        floating_ip_id: &str,
    ) -> Result<FloatingIp, BackendError> {
        let request = self.request(
            reqwest::Method::PUT,
            &format!(
                "/instances/{instance_id}/network_interfaces/{interface_id}/floating_ips/{floating_ip_id}"
            ),
        );
        self.transport.json(request).await
    }
}

// ============================================================================
// Tagging
// ============================================================================

/// Global tagging client.
#[derive(Debug, Clone)]
pub struct TaggingClient {
    transport: Transport,
    base_url: String,
}

impl TaggingClient {
    /// Create a client for the tagging `endpoint`.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(endpoint: &str, auth: Arc<IamAuthenticator>) -> Result<Self, BackendError> {
        Ok(Self {
            transport: Transport::new(auth)?,
            base_url: format!("{}/v3/tags", endpoint.trim_end_matches('/')),
        })
    }

    async fn mutate(&self, op: &str, crn: &str, tags: &[String]) -> Result<bool, BackendError> {
        let url = format!("{}/{op}", self.base_url);
        debug!(url = %url, crn = %crn, tags = ?tags, "Tag request");

        let body = TagRequest {
            resources: vec![TagResource {
                resource_id: crn.to_string(),
            }],
            tag_names: tags.to_vec(),
        };
        let request = self
            .transport
            .client
            .post(&url)
            .query(&[("tag_type", "user")])
            .json(&body);
        let results: TagResults = self.transport.json(request).await?;
        let failed: Vec<&str> = results
            .results
            .iter()
            .filter(|r| r.is_error)
            .map(|r| r.resource_id.as_deref().unwrap_or(crn))
            .collect();
        if !failed.is_empty() {
            warn!(operation = op, resources = ?failed, "Tag service reported errors");
        }
        Ok(failed.is_empty())
    }
}

#[async_trait]
impl TaggingApi for TaggingClient {
    async fn attach_tags(&self, crn: &str, tags: &[String]) -> Result<bool, BackendError> {
        self.mutate("attach", crn, tags).await
    }

    async fn detach_tags(&self, crn: &str, tags: &[String]) -> Result<bool, BackendError> {
        self.mutate("detach", crn, tags).await
    }

    async fn list_tags(&self, crn: &str) -> Result<Vec<String>, BackendError> {
        debug!(url = %self.base_url, crn = %crn, "GET request");
        let request = self
            .transport
            .client
            .get(&self.base_url)
            .query(&[("attached_to", crn), ("tag_type", "user")]);
        let list: TagList = self.transport.json(request).await?;
        Ok(list.items.into_iter().map(|t| t.name).collect())
    }
}

// ============================================================================
// Search
// ============================================================================

/// Global search client.
#[derive(Debug, Clone)]
pub struct SearchClient {
    transport: Transport,
    url: String,
}

impl SearchClient {
    /// Create a client for the search `endpoint`.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(endpoint: &str, auth: Arc<IamAuthenticator>) -> Result<Self, BackendError> {
        Ok(Self {
            transport: Transport::new(auth)?,
            url: format!("{}/v3/resources/search", endpoint.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl SearchApi for SearchClient {
    async fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchItem>, BackendError> {
        debug!(url = %self.url, query = %query, "Search request");
        let body = SearchRequest {
            query: query.to_string(),
            fields: vec!["*".to_string()],
        };
        let request = self
            .transport
            .client
            .post(&self.url)
            .query(&[("limit", limit)])
            .json(&body);
        let response: SearchResponse = self.transport.json(request).await?;
        Ok(response.items)
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds fresh VPC clients sharing one IAM token cache.
#[derive(Debug, Clone)]
pub struct VpcClientFactory {
    auth: Arc<IamAuthenticator>,
    endpoint: String,
    tagging_endpoint: String,
    search_endpoint: String,
}

impl VpcClientFactory {
    /// Create a factory from provider settings.
    ///
    /// # Errors
    /// Returns error if the API key is missing or the HTTP client cannot be
    /// created.
    pub fn new(config: &ProviderConfig) -> Result<Self, BackendError> {
        Ok(Self {
            auth: Arc::new(IamAuthenticator::new(
                config.iam_endpoint.as_str(),
                config.iam_api_key.as_str(),
            )?),
            endpoint: config.endpoint.clone(),
            tagging_endpoint: config.tagging_endpoint.clone(),
            search_endpoint: config.search_endpoint.clone(),
        })
    }
}

impl ClientFactory for VpcClientFactory {
    fn compute(&self) -> Result<Arc<dyn ComputeApi>, BackendError> {
        Ok(Arc::new(VpcClient::new(&self.endpoint, Arc::clone(&self.auth))?))
    }

    fn tagging(&self) -> Result<Arc<dyn TaggingApi>, BackendError> {
        Ok(Arc::new(TaggingClient::new(
            &self.tagging_endpoint,
            Arc::clone(&self.auth),
        )?))
    }

    fn search(&self) -> Result<Arc<dyn SearchApi>, BackendError> {
        Ok(Arc::new(SearchClient::new(
            &self.search_endpoint,
            Arc::clone(&self.auth),
        )?))
    }
}
