//! Concurrent node creation and termination.
//!
//! Creation is a sequence of independent backend calls (create, floating IP,
//! wait for running, tag) with no atomicity between them. Each new instance is
//! registered as pending right after creation so reconciliation keeps
//! reporting it while its tags are still missing from search.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::SharedCache;
use crate::clients::SharedClients;
use crate::config::{NodeTemplate, ProviderConfig, Timings};
use crate::error::ProviderError;
use crate::node::{
    build_query, instance_name, tags_to_list, Node, NodeRole, NodeStatus, TagFilter,
    TAG_CLUSTER_NAME, TAG_LAUNCH_CONFIG, TAG_NODE_KIND, TAG_NODE_NAME,
};
use crate::providers::{
    BackendError, BootVolumeAttachment, ComputeApi, FloatingIp, FloatingIpPrototype, IdRef,
    Instance, InstanceAction, InstancePrototype, NameRef, NetworkInterfacePrototype,
    VolumePrototype,
};
use crate::reconcile::SEARCH_LIMIT;
use crate::retry::{with_retry, RetryConfig};
use crate::tagging::TagManager;

/// Name prefix of floating IPs this provider creates and may delete.
pub const RECYCLABLE_PREFIX: &str = "ray-recyclable";

/// Result of a batch create: every node that came up plus every failure.
#[derive(Debug, Default)]
pub struct CreateOutcome {
    /// Reused and newly created nodes by id.
    pub nodes: HashMap<String, Node>,
    /// Failures of individual units.
    pub errors: Vec<ProviderError>,
}

impl CreateOutcome {
    /// Collapse into a single result.
    ///
    /// # Errors
    /// Returns the unit's own error when the only unit failed, otherwise
    /// [`ProviderError::PartialBatch`] listing the nodes that did come up.
    pub fn into_result(self) -> Result<HashMap<String, Node>, ProviderError> {
        let mut completed: Vec<String> = self.nodes.keys().cloned().collect();
        completed.sort();
        batch_result(completed, self.errors)?;
        Ok(self.nodes)
    }
}

/// Result of a batch terminate.
#[derive(Debug, Default)]
pub struct TerminateOutcome {
    /// Ids terminated (or already absent).
    pub terminated: Vec<String>,
    /// Ids that failed with their error.
    pub errors: Vec<(String, ProviderError)>,
}

impl TerminateOutcome {
    /// Collapse into a single result.
    ///
    /// # Errors
    /// Same rules as [`CreateOutcome::into_result`].
    pub fn into_result(self) -> Result<(), ProviderError> {
        batch_result(
            self.terminated,
            self.errors.into_iter().map(|(_, e)| e).collect(),
        )
    }
}

fn batch_result(
    completed: Vec<String>,
    mut errors: Vec<ProviderError>,
) -> Result<(), ProviderError> {
    if errors.is_empty() {
        Ok(())
    } else if completed.is_empty() && errors.len() == 1 {
        Err(errors.remove(0))
    } else {
        Err(ProviderError::PartialBatch { completed, errors })
    }
}

/// Create/terminate orchestration.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    cluster_name: String,
    zone_name: String,
    cache_stopped_nodes: bool,
    timings: Timings,
    retry: RetryConfig,
    clients: Arc<SharedClients>,
    cache: SharedCache,
    tags: TagManager,
}

impl Lifecycle {
    #[must_use]
    pub fn new(
        cluster_name: impl Into<String>,
        config: &ProviderConfig,
        clients: Arc<SharedClients>,
        cache: SharedCache,
        tags: TagManager,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            zone_name: config.zone_name.clone(),
            cache_stopped_nodes: config.cache_stopped_nodes,
            timings: config.timings,
            retry: RetryConfig::from_timings(&config.timings),
            clients,
            cache,
            tags,
        }
    }

    /// Bring `count` nodes with `tags` into existence.
    ///
    /// Stopped nodes with a matching role and launch config are restarted
    /// first when stopped-node caching is on; the remainder is created
    /// concurrently, one task per instance. A failing task does not cancel its
    /// siblings; see [`CreateOutcome`].
    ///
    /// # Errors
    /// Returns error if the stopped-node reuse step fails; per-instance
    /// failures are reported in the outcome instead.
    pub async fn create_nodes(
        &self,
        template: &NodeTemplate,
        tags: &BTreeMap<String, String>,
        count: usize,
    ) -> Result<CreateOutcome, ProviderError> {
        let mut outcome = CreateOutcome::default();

        if self.cache_stopped_nodes && count > 0 {
            outcome.nodes = self.reuse_stopped(tags, count).await?;
        }

        let remaining = count.saturating_sub(outcome.nodes.len());
        if remaining == 0 {
            return Ok(outcome);
        }

        info!(count = remaining, cluster = %self.cluster_name, "Creating instances");
        let template = Arc::new(template.clone());
        let tags = Arc::new(tags.clone());
        let mut set = JoinSet::new();
        for _ in 0..remaining {
            let this = self.clone();
            let template = Arc::clone(&template);
            let tags = Arc::clone(&tags);
            set.spawn(async move { this.create_node(&template, &tags).await });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(node)) => {
                    outcome.nodes.insert(node.id.clone(), node);
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Instance creation failed");
                    outcome.errors.push(e);
                }
                Err(e) => outcome.errors.push(e.into()),
            }
        }

        Ok(outcome)
    }

    /// Terminate every id concurrently.
    ///
    /// Stops instead of deleting when stopped-node caching is on. Ids the
    /// backend no longer knows count as terminated. Each id is retried on
    /// transient faults with a client reinit in between.
    pub async fn terminate_nodes(&self, ids: &[String]) -> TerminateOutcome {
        let mut outcome = TerminateOutcome::default();
        if ids.is_empty() {
            return outcome;
        }

        let mut set = JoinSet::new();
        let mut task_ids = HashMap::new();
        for id in ids {
            info!(node_id = %id, "Terminating node");
            let this = self.clone();
            let task_id = id.clone();
            let handle = set.spawn(async move {
                let result = with_retry(
                    &this.retry,
                    "terminate_node",
                    || this.clients.reinit().map_err(Into::into),
                    || this.terminate_node(&task_id),
                )
                .await;
                (task_id, result)
            });
            task_ids.insert(handle.id(), id.clone());
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, Ok(()))) => outcome.terminated.push(id),
                Ok((id, Err(e))) => {
                    error!(node_id = %id, error = %e, "Failed to terminate node");
                    outcome.errors.push((id, e));
                }
                Err(e) => {
                    let id = task_ids.remove(&e.id()).unwrap_or_default();
                    error!(node_id = %id, error = %e, "Terminate task failed");
                    outcome.errors.push((id, e.into()));
                }
            }
        }
        outcome.terminated.sort();
        outcome
    }

    /// Terminate one node and purge it from every cache scope.
    ///
    /// # Errors
    /// Returns the backend error unless it is a not-found.
    pub async fn terminate_node(&self, id: &str) -> Result<(), ProviderError> {
        let compute = self.clients.compute();
        if self.cache_stopped_nodes {
            info!(
                node_id = %id,
                "Stopping instance (set cache_stopped_nodes: false to delete instead)"
            );
            match compute.instance_action(id, InstanceAction::Stop).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!(node_id = %id, "Instance already gone"),
                Err(e) => return Err(e.into()),
            }
        } else {
            info!(node_id = %id, "Deleting instance");
            delete_node(compute.as_ref(), id).await?;
        }

        self.cache.lock().await.mark_deleted(id);
        Ok(())
    }

    async fn create_node(
        &self,
        template: &NodeTemplate,
        tags: &BTreeMap<String, String>,
    ) -> Result<Node, ProviderError> {
        let base = tags
            .get(TAG_NODE_NAME)
            .ok_or_else(|| ProviderError::InvalidNodeName {
                name: String::new(),
                reason: format!("missing {TAG_NODE_NAME} tag"),
            })?;
        let name = instance_name(base)?;
        let role = match tags.get(TAG_NODE_KIND) {
            Some(kind) => kind.parse()?,
            None => NodeRole::from_name(&name, &self.cluster_name).unwrap_or(NodeRole::Worker),
        };

        let mut full_tags = tags.clone();
        full_tags.insert(TAG_CLUSTER_NAME.to_string(), self.cluster_name.clone());
        full_tags.insert(TAG_NODE_NAME.to_string(), name.clone());
        full_tags.insert(TAG_NODE_KIND.to_string(), role.to_string());
        let tag_list = tags_to_list(&full_tags);

        let instance = self.create_instance(&name, template).await?;

        self.cache.lock().await.add_pending(
            Node::from_instance(&instance, role, Vec::new()),
            tag_list.clone(),
            Instant::now(),
        );

        let mut floating_ips = Vec::new();
        if role == NodeRole::Head {
            let fip = self.create_floating_ip(template).await?;
            self.attach_floating_ip(&instance, &fip).await?;
            floating_ips.push(fip.address);
        }

        // Tags attached before the instance runs are frequently lost by the
        // tagging service.
        let instance = self.wait_running(&instance.id).await?;
        self.cache.lock().await.touch_pending(&instance.id, Instant::now());

        if !self.tags.attach(&instance.crn, &tag_list).await? {
            error!(node_id = %instance.id, tags = ?tag_list, "Failed to tag instance");
            return Err(ProviderError::TagVerification {
                operation: "attach",
                crn: instance.crn.clone(),
                tags: tag_list,
            });
        }
        info!(node_id = %instance.id, tags = ?tag_list, "Attached tags");

        let mut node = Node::from_instance(&instance, role, tag_list);
        node.floating_ips = floating_ips;
        Ok(node)
    }

    async fn create_instance(
        &self,
        name: &str,
        template: &NodeTemplate,
    ) -> Result<Instance, ProviderError> {
        info!(name = %name, "Creating instance");
        let compute = self.clients.compute();
        let prototype = instance_prototype(name, template, &self.zone_name);

        match compute.create_instance(&prototype).await {
            Ok(instance) => {
                info!(name = %name, node_id = %instance.id, "Instance created");
                Ok(instance)
            }
            Err(BackendError::AlreadyExists(message)) => {
                info!(name = %name, "Instance already exists, reusing it");
                compute
                    .find_instance_by_name(name)
                    .await?
                    .ok_or_else(|| BackendError::AlreadyExists(message).into())
            }
            Err(BackendError::QuotaExceeded(message)) => {
                error!(name = %name, "Instance creation failed due to quota limit");
                Err(ProviderError::QuotaExceeded {
                    name: name.to_string(),
                    message,
                })
            }
            Err(e) => {
                error!(name = %name, error = %e, "Instance creation failed");
                Err(e.into())
            }
        }
    }

    /// Reuse the configured head address if it exists, otherwise reserve a
    /// recyclable one.
    async fn create_floating_ip(
        &self,
        template: &NodeTemplate,
    ) -> Result<FloatingIp, ProviderError> {
        let compute = self.clients.compute();
        if let Some(head_ip) = &template.head_ip {
            let existing = compute
                .list_floating_ips()
                .await?
                .into_iter()
                .find(|ip| ip.address == *head_ip);
            if let Some(ip) = existing {
                info!(address = %ip.address, "Reusing configured floating IP");
                return Ok(ip);
            }
            warn!(address = %head_ip, "Configured head_ip not found, reserving a new address");
        }

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{RECYCLABLE_PREFIX}-{}", &suffix[..4]);
        info!(name = %name, "Creating floating IP");
        let prototype = FloatingIpPrototype {
            name,
            zone: NameRef {
                name: self.zone_name.clone(),
            },
            resource_group: IdRef {
                id: template.resource_group_id.clone(),
            },
        };
        Ok(compute.create_floating_ip(&prototype).await?)
    }

    async fn attach_floating_ip(
        &self,
        instance: &Instance,
        fip: &FloatingIp,
    ) -> Result<(), ProviderError> {
        let compute = self.clients.compute();
        let nic = &instance.primary_network_interface.id;
        let bound = compute.list_interface_floating_ips(&instance.id, nic).await?;
        if bound.iter().any(|ip| ip.id == fip.id) {
            info!(address = %fip.address, node_id = %instance.id, "Floating IP already attached");
            return Ok(());
        }

        info!(address = %fip.address, node_id = %instance.id, "Attaching floating IP");
        compute.attach_floating_ip(&instance.id, nic, &fip.id).await?;
        Ok(())
    }

    /// Poll until the instance runs; delete it once the pending timeout
    /// passes.
    async fn wait_running(&self, id: &str) -> Result<Instance, ProviderError> {
        let start = Instant::now();
        let timeout = self.timings.pending_timeout();
        let mut instance = self.clients.compute().get_instance(id).await?;

        while NodeStatus::parse(&instance.status) != NodeStatus::Running {
            if start.elapsed() > timeout {
                error!(
                    node_id = %id,
                    timeout_secs = timeout.as_secs(),
                    "Pending timeout reached, deleting instance"
                );
                // Left pending on failure so reconciliation retries the delete.
                if let Err(e) = delete_node(self.clients.compute().as_ref(), id).await {
                    error!(node_id = %id, error = %e, "Failed to delete stuck instance");
                    return Err(e.into());
                }
                self.cache.lock().await.mark_deleted(id);
                return Err(ProviderError::PendingTimeout {
                    id: id.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }

            tokio::time::sleep(self.timings.poll_interval()).await;
            instance = self.clients.compute().get_instance(id).await?;
            debug!(node_id = %id, status = %instance.status, "Polling instance status");
        }

        Ok(instance)
    }

    /// Restart up to `limit` stopped nodes matching the role and launch
    /// config in `tags`.
    async fn reuse_stopped(
        &self,
        tags: &BTreeMap<String, String>,
        limit: usize,
    ) -> Result<HashMap<String, Node>, ProviderError> {
        let mut filter = TagFilter::new();
        for key in [TAG_NODE_KIND, TAG_LAUNCH_CONFIG] {
            if let Some(value) = tags.get(key) {
                filter.insert(key.to_string(), value.clone());
            }
        }
        let query = build_query(&self.cluster_name, &filter);

        let items = match self.clients.search().search(&query, SEARCH_LIMIT).await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "Stopped node search failed, reinitializing search client");
                self.clients.reinit_search()?;
                self.clients.search().search(&query, SEARCH_LIMIT).await?
            }
        };

        let compute = self.clients.compute();
        let mut stopped = Vec::new();
        for item in items {
            if stopped.len() >= limit {
                break;
            }
            match compute.get_instance(&item.resource_id).await {
                Ok(instance)
                    if matches!(
                        NodeStatus::parse(&instance.status),
                        NodeStatus::Stopped | NodeStatus::Stopping
                    ) =>
                {
                    stopped.push((item, instance));
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    debug!(node_id = %item.resource_id, "Stopped candidate no longer exists");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut nodes = HashMap::new();
        if stopped.is_empty() {
            return Ok(nodes);
        }

        let ids: Vec<&str> = stopped.iter().map(|(item, _)| item.resource_id.as_str()).collect();
        info!(
            nodes = ?ids,
            "Reusing stopped nodes (set cache_stopped_nodes: false to disable reuse)"
        );

        for (item, _) in &stopped {
            info!(node_id = %item.resource_id, "Starting instance");
            compute
                .instance_action(&item.resource_id, InstanceAction::Start)
                .await?;
        }
        tokio::time::sleep(self.timings.poll_interval()).await;

        for (item, instance) in stopped {
            self.tags.apply(&item.crn, tags).await?;
            self.cache.lock().await.undelete(&item.resource_id);

            let mut node = Node::from_search(&item, &instance, &self.cluster_name);
            node.status = NodeStatus::Starting;
            nodes.insert(node.id.clone(), node);
        }
        Ok(nodes)
    }
}

/// Build the instance creation body.
#[must_use]
pub fn instance_prototype(
    name: &str,
    template: &NodeTemplate,
    zone_name: &str,
) -> InstancePrototype {
    InstancePrototype {
        name: name.to_string(),
        keys: vec![IdRef {
            id: template.key_id.clone(),
        }],
        profile: NameRef {
            name: template.instance_profile_name.clone(),
        },
        resource_group: IdRef {
            id: template.resource_group_id.clone(),
        },
        vpc: IdRef {
            id: template.vpc_id.clone(),
        },
        image: IdRef {
            id: template.image_id.clone(),
        },
        zone: NameRef {
            name: zone_name.to_string(),
        },
        boot_volume_attachment: BootVolumeAttachment {
            delete_volume_on_instance_delete: true,
            volume: VolumePrototype {
                capacity: template.boot_volume_capacity,
                name: format!("{name}-boot"),
                profile: NameRef {
                    name: template.volume_tier_name.clone(),
                },
            },
        },
        primary_network_interface: NetworkInterfacePrototype {
            name: "eth0".to_string(),
            subnet: IdRef {
                id: template.subnet_id.clone(),
            },
            security_groups: vec![IdRef {
                id: template.security_group_id.clone(),
            }],
        },
    }
}

/// Delete an instance and the recyclable floating IPs bound to it.
///
/// A not-found anywhere counts as already deleted.
///
/// # Errors
/// Returns any other backend error from the delete calls.
pub async fn delete_node(compute: &dyn ComputeApi, id: &str) -> Result<(), BackendError> {
    let floating_ips = match compute.get_instance(id).await {
        Ok(instance) => compute
            .list_interface_floating_ips(id, &instance.primary_network_interface.id)
            .await
            .unwrap_or_else(|e| {
                warn!(node_id = %id, error = %e, "Could not list floating IPs before delete");
                Vec::new()
            }),
        Err(e) if e.is_not_found() => {
            debug!(node_id = %id, "Instance already deleted");
            return Ok(());
        }
        Err(e) => {
            warn!(node_id = %id, error = %e, "Could not fetch instance before delete");
            Vec::new()
        }
    };

    match compute.delete_instance(id).await {
        Ok(()) => info!(node_id = %id, "Instance deleted"),
        Err(e) if e.is_not_found() => debug!(node_id = %id, "Instance already deleted"),
        Err(e) => return Err(e),
    }

    for ip in floating_ips
        .iter()
        .filter(|ip| ip.name.starts_with(RECYCLABLE_PREFIX))
    {
        match compute.delete_floating_ip(&ip.id).await {
            Ok(()) => info!(address = %ip.address, "Released floating IP"),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
