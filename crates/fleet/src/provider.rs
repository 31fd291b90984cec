//! Host-facing node provider.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::cache::{NodeCache, SharedCache};
use crate::clients::{ClientFactory, SharedClients};
use crate::config::{ClusterConfig, NodeTemplate, ProviderConfig};
use crate::error::ProviderError;
use crate::lifecycle::Lifecycle;
use crate::node::{split_tag, Node, NodeRole, NodeStatus, TagFilter, TAG_NODE_STATUS};
use crate::providers::vpc::VpcClientFactory;
use crate::reconcile::Reconciler;
use crate::retry::{with_retry, RetryConfig};
use crate::tagging::TagManager;

/// Operations the cluster orchestrator drives.
///
/// Every query reconciles against the backend before answering, so callers
/// never see a node the provider has already terminated.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    /// Ids of pending, starting or running nodes matching `filter`.
    async fn non_terminated_nodes(&self, filter: &TagFilter) -> Result<Vec<String>, ProviderError>;

    /// Whether the node is running.
    async fn is_running(&self, id: &str) -> Result<bool, ProviderError>;

    /// Whether the node is neither pending, starting nor running.
    async fn is_terminated(&self, id: &str) -> Result<bool, ProviderError>;

    /// Tags of the node as a map.
    async fn node_tags(&self, id: &str) -> Result<BTreeMap<String, String>, ProviderError>;

    /// Attach tags, replacing the status tag when one is given.
    async fn set_node_tags(
        &self,
        id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError>;

    /// Public address of the node.
    async fn external_ip(&self, id: &str) -> Result<Option<String>, ProviderError>;

    /// Private address of the node.
    async fn internal_ip(&self, id: &str) -> Result<Option<String>, ProviderError>;

    /// Create `count` nodes from `template` carrying `tags`.
    async fn create_node(
        &self,
        template: &NodeTemplate,
        tags: &BTreeMap<String, String>,
        count: usize,
    ) -> Result<HashMap<String, Node>, ProviderError>;

    /// Terminate one node.
    async fn terminate_node(&self, id: &str) -> Result<(), ProviderError>;

    /// Terminate several nodes concurrently.
    async fn terminate_nodes(&self, ids: &[String]) -> Result<(), ProviderError>;
}

/// [`NodeProvider`] over the VPC compute, tagging and search services.
#[derive(Debug, Clone)]
pub struct VpcNodeProvider {
    cluster_name: String,
    use_hybrid_ips: bool,
    retry: RetryConfig,
    clients: Arc<SharedClients>,
    cache: SharedCache,
    tags: TagManager,
    reconciler: Reconciler,
    lifecycle: Lifecycle,
}

impl VpcNodeProvider {
    /// Create a provider whose backend clients come from `factory`.
    ///
    /// # Errors
    /// Returns error if the initial clients cannot be built.
    pub fn new(
        cluster_name: impl Into<String>,
        config: &ProviderConfig,
        factory: Arc<dyn ClientFactory>,
    ) -> Result<Self, ProviderError> {
        let cluster_name = cluster_name.into();
        let clients = Arc::new(SharedClients::new(factory)?);
        let cache = NodeCache::shared();
        let tags = TagManager::new(Arc::clone(&clients), &config.timings);
        let reconciler = Reconciler::new(
            cluster_name.clone(),
            Arc::clone(&clients),
            Arc::clone(&cache),
            config.timings,
        );
        let lifecycle = Lifecycle::new(
            cluster_name.clone(),
            config,
            Arc::clone(&clients),
            Arc::clone(&cache),
            tags.clone(),
        );

        info!(
            cluster = %cluster_name,
            zone = %config.zone_name,
            cache_stopped_nodes = config.cache_stopped_nodes,
            "Node provider initialized"
        );

        Ok(Self {
            cluster_name,
            use_hybrid_ips: config.use_hybrid_ips,
            retry: RetryConfig::from_timings(&config.timings),
            clients,
            cache,
            tags,
            reconciler,
            lifecycle,
        })
    }

    /// Create a provider talking to the VPC APIs configured in `config`.
    ///
    /// `api_key` overrides the key from the configuration file.
    ///
    /// # Errors
    /// Returns error if no API key is available or the clients cannot be
    /// built.
    pub fn from_config(
        config: &ClusterConfig,
        api_key: Option<String>,
    ) -> Result<Self, ProviderError> {
        let mut provider = config.provider.clone();
        if let Some(key) = api_key {
            provider.iam_api_key = key;
        }
        let factory = VpcClientFactory::new(&provider)?;
        Self::new(config.cluster_name.clone(), &provider, Arc::new(factory))
    }

    /// Shared node cache.
    #[must_use]
    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    async fn retry<T, F, Fut>(&self, operation_name: &str, f: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        with_retry(
            &self.retry,
            operation_name,
            || self.clients.reinit().map_err(Into::into),
            f,
        )
        .await
    }

    /// Node from the cache, refreshing it from the backend when unknown.
    ///
    /// # Errors
    /// Returns [`ProviderError::NodeNotFound`] if the backend has no such
    /// instance.
    pub async fn get_cached_node(&self, id: &str) -> Result<Node, ProviderError> {
        let cached = self.cache.lock().await.cached(id).cloned();
        match cached {
            Some(node) => Ok(node),
            None => self.get_node(id).await,
        }
    }

    /// Refresh the node from the backend.
    ///
    /// Reconciles the whole cluster first; instances the search index has
    /// not picked up yet are read directly from the instance and tag APIs.
    ///
    /// # Errors
    /// Returns [`ProviderError::NodeNotFound`] if the backend has no such
    /// instance.
    pub async fn get_node(&self, id: &str) -> Result<Node, ProviderError> {
        self.retry("get_node", || self.lookup(id)).await
    }

    async fn lookup(&self, id: &str) -> Result<Node, ProviderError> {
        self.reconciler.list_non_terminated(&TagFilter::new()).await?;
        if let Some(node) = self.cache.lock().await.cached(id).cloned() {
            return Ok(node);
        }

        debug!(node_id = %id, "Node not indexed yet, reading it directly");
        let compute = self.clients.compute();
        let instance = match compute.get_instance(id).await {
            Ok(instance) => instance,
            Err(e) if e.is_not_found() => return Err(ProviderError::NodeNotFound(id.to_string())),
            Err(e) => return Err(e.into()),
        };

        let tags = self.tags.list(&instance.crn).await?;
        let role = NodeRole::from_tags(&tags)
            .or_else(|| NodeRole::from_name(&instance.name, &self.cluster_name))
            .unwrap_or(NodeRole::Worker);
        let mut node = Node::from_instance(&instance, role, tags);
        if role == NodeRole::Head {
            node.floating_ips = compute
                .list_interface_floating_ips(id, &instance.primary_network_interface.id)
                .await?
                .into_iter()
                .map(|ip| ip.address)
                .collect();
        }

        self.cache.lock().await.upsert_cached(node.clone());
        Ok(node)
    }

    async fn apply_tags(
        &self,
        id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError> {
        let node = self.get_cached_node(id).await?;
        self.tags.apply(&node.crn, tags).await?;

        let mut cache = self.cache.lock().await;
        if let Some(mut node) = cache.cached(id).cloned() {
            let replacing_status = tags.contains_key(TAG_NODE_STATUS);
            node.tags.retain(|t| {
                split_tag(t).is_none_or(|(k, _)| {
                    !tags.contains_key(k) && !(replacing_status && k == TAG_NODE_STATUS)
                })
            });
            node.tags.extend(tags.iter().map(|(k, v)| format!("{k}:{v}")));
            cache.upsert_cached(node);
        }
        Ok(())
    }
}

#[async_trait]
impl NodeProvider for VpcNodeProvider {
    async fn non_terminated_nodes(&self, filter: &TagFilter) -> Result<Vec<String>, ProviderError> {
        self.retry("non_terminated_nodes", || {
            self.reconciler.list_non_terminated(filter)
        })
        .await
    }

    async fn is_running(&self, id: &str) -> Result<bool, ProviderError> {
        Ok(self.get_cached_node(id).await?.status == NodeStatus::Running)
    }

    async fn is_terminated(&self, id: &str) -> Result<bool, ProviderError> {
        Ok(!self.get_cached_node(id).await?.status.is_alive())
    }

    async fn node_tags(&self, id: &str) -> Result<BTreeMap<String, String>, ProviderError> {
        Ok(self.get_cached_node(id).await?.tag_map(&self.cluster_name))
    }

    async fn set_node_tags(
        &self,
        id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<(), ProviderError> {
        self.retry("set_node_tags", || self.apply_tags(id, tags)).await
    }

    async fn external_ip(&self, id: &str) -> Result<Option<String>, ProviderError> {
        let node = self.get_cached_node(id).await?;
        if self.use_hybrid_ips && node.role == NodeRole::Worker {
            return self.internal_ip(id).await;
        }
        if let Some(ip) = node.floating_ips.first() {
            return Ok(Some(ip.clone()));
        }
        Ok(self.get_node(id).await?.floating_ips.first().cloned())
    }

    async fn internal_ip(&self, id: &str) -> Result<Option<String>, ProviderError> {
        let node = self.get_cached_node(id).await?;
        if node.private_ip.is_some() {
            return Ok(node.private_ip);
        }
        Ok(self.get_node(id).await?.private_ip)
    }

    async fn create_node(
        &self,
        template: &NodeTemplate,
        tags: &BTreeMap<String, String>,
        count: usize,
    ) -> Result<HashMap<String, Node>, ProviderError> {
        self.lifecycle
            .create_nodes(template, tags, count)
            .await?
            .into_result()
    }

    async fn terminate_node(&self, id: &str) -> Result<(), ProviderError> {
        self.terminate_nodes(&[id.to_string()]).await
    }

    async fn terminate_nodes(&self, ids: &[String]) -> Result<(), ProviderError> {
        self.lifecycle.terminate_nodes(ids).await.into_result()
    }
}
