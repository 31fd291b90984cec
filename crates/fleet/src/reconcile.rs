//! Reconciliation of tag search results with the authoritative instance API.
//!
//! The search index lags behind tag writes and occasionally drops or resurrects
//! entries. A pass is accepted once no id seen by an earlier clean pass is
//! missing; otherwise the search is repeated a bounded number of times and the
//! latest result wins.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::{NodeCache, SeenScope, SharedCache};
use crate::clients::SharedClients;
use crate::config::Timings;
use crate::error::ProviderError;
use crate::lifecycle::delete_node;
use crate::node::{
    build_query, Node, NodeRole, NodeStatus, StatusTag, TagFilter, TAG_NODE_KIND, TAG_NODE_STATUS,
};

/// Page size requested from the search service.
pub const SEARCH_LIMIT: u32 = 1000;
/// Search passes per reconciliation before the latest result is accepted.
pub const MAX_PASSES: u32 = 20;

/// Search/instance-API reconciliation over the shared node cache.
#[derive(Debug, Clone)]
pub struct Reconciler {
    cluster_name: String,
    clients: Arc<SharedClients>,
    cache: SharedCache,
    timings: Timings,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        cluster_name: impl Into<String>,
        clients: Arc<SharedClients>,
        cache: SharedCache,
        timings: Timings,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            clients,
            cache,
            timings,
        }
    }

    /// Ids of live nodes matching `filter`, refreshing the node cache.
    ///
    /// Found ids come first in search order, followed by pending nodes that
    /// are not indexed yet but will carry the filtered tags.
    ///
    /// # Errors
    /// Returns search errors and instance lookup errors other than not-found.
    pub async fn list_non_terminated(
        &self,
        filter: &TagFilter,
    ) -> Result<Vec<String>, ProviderError> {
        let query = build_query(&self.cluster_name, filter);
        let head_query =
            filter.get(TAG_NODE_KIND).map(String::as_str) == Some(NodeRole::Head.as_str());
        let uninitialized_head = head_query
            && filter.get(TAG_NODE_STATUS).map(String::as_str)
                == Some(StatusTag::Uninitialized.as_str());
        let query_scope = SeenScope::Query(query.clone());
        let scope = if head_query {
            SeenScope::Head
        } else {
            query_scope.clone()
        };

        let mut cache = self.cache.lock().await;
        let mut missing: HashSet<String> = HashSet::new();
        let mut pass = 0;

        let found = loop {
            pass += 1;
            if pass > 1 {
                info!(query = %query, pass, "Repeating search");
            }

            let found = self.search_candidates(&cache, &query).await?;
            let found_ids: HashSet<&str> = found.iter().map(|n| n.id.as_str()).collect();
            let now_missing: HashSet<String> = cache
                .seen(&scope)
                .into_iter()
                .filter(|id| !found_ids.contains(id.as_str()))
                .collect();

            if now_missing.is_empty() {
                debug!(query = %query, "Found nodes include every previously seen node");
                missing.clear();
                record_seen(&mut cache, &found, &query_scope);
                break found;
            }

            // Head IP refresh queries carry a stale status filter; the head is
            // expected to be absent.
            if uninitialized_head {
                break found;
            }

            if !missing.is_empty() && now_missing != missing {
                info!(query = %query, "Missing nodes differ from the previous pass");
            }
            missing = now_missing;

            if pass >= MAX_PASSES {
                warn!(
                    query = %query,
                    missing = ?missing,
                    "Search still missing previously seen nodes, accepting latest result"
                );
                record_seen(&mut cache, &found, &query_scope);
                break found;
            }

            warn!(
                query = %query,
                missing = ?missing,
                retries_left = MAX_PASSES - pass,
                "Previously seen nodes missing from search"
            );
            tokio::time::sleep(self.timings.search_retry_delay()).await;
        };

        for id in &missing {
            info!(node_id = %id, "Node disappeared, updating caches");
            cache.forget_seen_in(&SeenScope::Head, id);
            cache.forget_seen_in(&query_scope, id);
            cache.remove_cached(id);
        }

        let mut ids: Vec<String> = Vec::with_capacity(found.len());
        for node in &found {
            ids.push(node.id.clone());
            cache.upsert_cached(node.clone());
        }

        self.merge_pending(&mut cache, &found, filter, &mut ids).await?;
        Ok(ids)
    }

    /// One search pass: drop deleted, dead and ghost entries, resolve head
    /// floating IPs.
    async fn search_candidates(
        &self,
        cache: &NodeCache,
        query: &str,
    ) -> Result<Vec<Node>, ProviderError> {
        let items = self.clients.search().search(query, SEARCH_LIMIT).await?;
        let compute = self.clients.compute();
        let mut nodes = Vec::with_capacity(items.len());

        for item in items {
            let id = &item.resource_id;
            if cache.is_deleted(id) {
                debug!(node_id = %id, "Skipping node scheduled for delete");
                continue;
            }
            if !NodeStatus::parse(&item.doc.status).is_alive() {
                debug!(node_id = %id, status = %item.doc.status, "Skipping node not alive");
                continue;
            }

            let instance = match compute.get_instance(id).await {
                Ok(instance) => instance,
                Err(e) if e.is_not_found() => {
                    warn!(node_id = %id, "Search returned an instance that no longer exists");
                    continue;
                }
                Err(e) => {
                    error!(node_id = %id, error = %e, "Failed to fetch instance");
                    return Err(e.into());
                }
            };

            let mut node = Node::from_search(&item, &instance, &self.cluster_name);
            if node.role == NodeRole::Head {
                let floating_ips = compute
                    .list_interface_floating_ips(id, &instance.primary_network_interface.id)
                    .await?;
                if floating_ips.is_empty() {
                    debug!(node_id = %id, "Head node has no floating IP yet, skipping");
                    continue;
                }
                node.floating_ips = floating_ips.into_iter().map(|ip| ip.address).collect();
            }
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// Promote confirmed pending nodes and report or expire the rest.
    ///
    /// Only nodes that will match `filter` are judged: a node filtered out of
    /// this query says nothing about whether search has picked it up.
    async fn merge_pending(
        &self,
        cache: &mut NodeCache,
        found: &[Node],
        filter: &TagFilter,
        ids: &mut Vec<String>,
    ) -> Result<(), ProviderError> {
        let timeout = self.timings.pending_timeout();
        let now = Instant::now();

        for pending in cache.pending_nodes() {
            let id = pending.node.id.clone();
            if let Some(node) = found.iter().find(|n| n.id == id) {
                if node.status == NodeStatus::Running {
                    debug!(node_id = %id, "Pending node confirmed by search");
                    cache.remove_pending(&id);
                }
                continue;
            }
            if !pending.matches(filter) {
                continue;
            }

            let elapsed = pending
                .node
                .pending_since
                .map_or(Duration::ZERO, |since| now.saturating_duration_since(since));
            debug!(node_id = %id, elapsed_secs = elapsed.as_secs(), "Node still pending");

            if elapsed > timeout {
                error!(
                    node_id = %id,
                    timeout_secs = timeout.as_secs(),
                    "Pending timeout reached, deleting instance"
                );
                if let Err(e) = delete_node(self.clients.compute().as_ref(), &id).await {
                    error!(node_id = %id, error = %e, "Failed to delete timed out node");
                    return Err(e.into());
                }
                cache.mark_deleted(&id);
            } else if !ids.contains(&id) {
                ids.push(id);
                cache.upsert_cached(pending.node);
            }
        }
        Ok(())
    }
}

fn record_seen(cache: &mut NodeCache, found: &[Node], query_scope: &SeenScope) {
    for node in found {
        let scope = if node.role == NodeRole::Head {
            SeenScope::Head
        } else {
            query_scope.clone()
        };
        cache.record_seen(scope, &node.id);
    }
}
