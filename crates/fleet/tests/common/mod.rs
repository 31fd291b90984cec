//! In-memory VPC backend shared by the integration tests.
//!
//! The fake keeps the three services separate the way the real ones are: the
//! search index can lag behind instances, keep ghosts of deleted instances, or
//! hide entries for a number of queries, and tag listings can be stale.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use fleet::config::{NodeTemplate, ProviderConfig};
use fleet::node::{
    TAG_CLUSTER_NAME, TAG_LAUNCH_CONFIG, TAG_NODE_KIND, TAG_NODE_NAME, TAG_NODE_STATUS,
};
use fleet::providers::{
    BackendError, ComputeApi, FloatingIp, FloatingIpPrototype, Instance, InstanceAction,
    InstancePrototype, NetworkInterface, SearchApi, SearchDoc, SearchItem, TaggingApi,
};
use fleet::{ClientFactory, VpcNodeProvider};

pub const CLUSTER: &str = "c1";
pub const LAUNCH_CONFIG: &str = "lc1";

#[derive(Debug, Clone)]
pub struct FakeInstance {
    pub instance: Instance,
    pub tags: Vec<String>,
    /// Status polls left before a pending instance turns running.
    pub polls_left: u32,
}

#[derive(Debug, Default)]
pub struct State {
    pub next_id: u32,
    pub instances: BTreeMap<String, FakeInstance>,
    pub floating_ips: BTreeMap<String, FloatingIp>,
    /// Floating IP id -> instance id.
    pub bindings: HashMap<String, String>,
    /// Stale index entries for resources that no longer exist.
    pub ghosts: Vec<SearchItem>,
    /// Index snapshots served instead of the live record.
    pub frozen: HashMap<String, SearchItem>,
    /// Searches left that omit the id.
    pub hidden: HashMap<String, u32>,
    /// New instances are hidden from this many searches.
    pub index_delay: u32,
    /// Status polls before a new instance runs; `u32::MAX` never boots.
    pub boot_polls: u32,
    /// Tag listings left that return nothing.
    pub stale_lists: u32,
    /// Tag mutations are accepted but flagged as failed.
    pub reject_tags: bool,
    /// Tag mutations left that fail with a transport-level error.
    pub tag_failures: u32,
    /// Searches left that fail with a server error.
    pub search_failures: u32,
    /// Instance reads left that fail with a server error.
    pub get_failures: u32,
    /// Instance deletes left that fail with a server error.
    pub delete_failures: u32,
    /// Start/stop actions panic inside the calling task.
    pub panic_on_action: bool,
    pub quota_exceeded: bool,
    /// Create succeeds server side but reports a name conflict.
    pub conflict_on_create: bool,
    pub calls: HashMap<&'static str, u32>,
}

fn unavailable() -> BackendError {
    BackendError::Api {
        status: 503,
        message: "service unavailable".to_string(),
    }
}

fn tag_values(query: &str) -> Vec<String> {
    query
        .split(" AND ")
        .filter_map(|part| part.strip_prefix("tags:\""))
        .map(|part| part.trim_end_matches('"').to_string())
        .collect()
}

fn search_item(fake: &FakeInstance) -> SearchItem {
    SearchItem {
        resource_id: fake.instance.id.clone(),
        crn: fake.instance.crn.clone(),
        name: fake.instance.name.clone(),
        tags: fake.tags.clone(),
        doc: SearchDoc {
            status: fake.instance.status.clone(),
            network_interfaces: vec![fake.instance.primary_network_interface.clone()],
        },
    }
}

#[derive(Debug, Default)]
pub struct FakeCloud {
    state: Mutex<State>,
}

impl FakeCloud {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self, name: &str) -> u32 {
        self.state().calls.get(name).copied().unwrap_or(0)
    }

    fn count(state: &mut State, name: &'static str) {
        *state.calls.entry(name).or_default() += 1;
    }

    fn new_instance(
        state: &mut State,
        name: &str,
        status: &str,
        tags: Vec<String>,
    ) -> FakeInstance {
        state.next_id += 1;
        let n = state.next_id;
        FakeInstance {
            instance: Instance {
                id: format!("i-{n}"),
                crn: format!("crn:i-{n}"),
                name: name.to_string(),
                status: status.to_string(),
                primary_network_interface: NetworkInterface {
                    id: format!("nic-{n}"),
                    name: Some("eth0".to_string()),
                    primary_ipv4_address: Some(format!("10.0.0.{n}")),
                },
                network_interfaces: vec![],
                created_at: None,
            },
            tags,
            polls_left: 0,
        }
    }

    /// Add an existing instance carrying `tags`; returns its id.
    pub fn seed(&self, name: &str, status: &str, tags: &[String]) -> String {
        let mut state = self.state();
        let fake = Self::new_instance(&mut state, name, status, tags.to_vec());
        let id = fake.instance.id.clone();
        state.instances.insert(id.clone(), fake);
        id
    }

    /// Add a worker of cluster [`CLUSTER`] in `status`.
    pub fn seed_worker(&self, status: &str) -> String {
        let n = self.state().next_id + 1;
        self.seed(
            &format!("ray-{CLUSTER}-worker-{n:08x}"),
            status,
            &node_tags("worker", "up-to-date"),
        )
    }

    /// Add a running head of cluster [`CLUSTER`], optionally with a bound
    /// floating IP.
    pub fn seed_head(&self, with_floating_ip: bool) -> String {
        let n = self.state().next_id + 1;
        let id = self.seed(
            &format!("ray-{CLUSTER}-head-{n:08x}"),
            "running",
            &node_tags("head", "up-to-date"),
        );
        if with_floating_ip {
            let fip = self.seed_floating_ip("ray-recyclable-ab12", "169.48.0.1");
            self.state().bindings.insert(fip, id.clone());
        }
        id
    }

    pub fn seed_floating_ip(&self, name: &str, address: &str) -> String {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("fip-{}", state.next_id);
        state.floating_ips.insert(
            id.clone(),
            FloatingIp {
                id: id.clone(),
                name: name.to_string(),
                address: address.to_string(),
            },
        );
        id
    }

    /// Remove an instance without leaving anything in the index.
    pub fn remove(&self, id: &str) {
        self.state().instances.remove(id);
    }

    /// Serve the current index entry of `id` from now on.
    pub fn freeze_index(&self, id: &str) {
        let mut state = self.state();
        let item = search_item(&state.instances[id]);
        state.frozen.insert(id.to_string(), item);
    }

    pub fn hide(&self, id: &str, searches: u32) {
        self.state().hidden.insert(id.to_string(), searches);
    }

    pub fn add_ghost(&self, id: &str, tags: &[String]) {
        self.state().ghosts.push(SearchItem {
            resource_id: id.to_string(),
            crn: format!("crn:{id}"),
            name: format!("ray-{CLUSTER}-worker-{id}"),
            tags: tags.to_vec(),
            doc: SearchDoc {
                status: "running".to_string(),
                network_interfaces: vec![],
            },
        });
    }

    pub fn instance(&self, id: &str) -> Option<FakeInstance> {
        self.state().instances.get(id).cloned()
    }

    pub fn status(&self, id: &str) -> Option<String> {
        self.instance(id).map(|f| f.instance.status)
    }

    pub fn tags(&self, id: &str) -> Vec<String> {
        self.instance(id).map(|f| f.tags).unwrap_or_default()
    }

    pub fn instance_count(&self) -> usize {
        self.state().instances.len()
    }

    pub fn bound_floating_ips(&self, id: &str) -> Vec<FloatingIp> {
        let state = self.state();
        state
            .bindings
            .iter()
            .filter(|(_, instance)| *instance == id)
            .filter_map(|(fip, _)| state.floating_ips.get(fip).cloned())
            .collect()
    }

    fn by_crn<'a>(state: &'a mut State, crn: &str) -> Result<&'a mut FakeInstance, BackendError> {
        state
            .instances
            .values_mut()
            .find(|f| f.instance.crn == crn)
            .ok_or_else(|| BackendError::NotFound(crn.to_string()))
    }

    fn tag_mutation(&self, crn: &str, tags: &[String], attach: bool) -> Result<bool, BackendError> {
        let mut state = self.state();
        Self::count(&mut state, if attach { "attach_tags" } else { "detach_tags" });
        if state.tag_failures > 0 {
            state.tag_failures -= 1;
            return Err(unavailable());
        }
        if state.reject_tags {
            return Ok(false);
        }
        let fake = Self::by_crn(&mut state, crn)?;
        if attach {
            for tag in tags {
                if !fake.tags.contains(tag) {
                    fake.tags.push(tag.clone());
                }
            }
        } else {
            fake.tags.retain(|t| !tags.contains(t));
        }
        Ok(true)
    }
}

#[async_trait]
impl ComputeApi for FakeCloud {
    async fn create_instance(
        &self,
        prototype: &InstancePrototype,
    ) -> Result<Instance, BackendError> {
        let mut state = self.state();
        Self::count(&mut state, "create_instance");
        if state.quota_exceeded {
            return Err(BackendError::QuotaExceeded(
                "Request is over quota for vCPU".to_string(),
            ));
        }
        if state.instances.values().any(|f| f.instance.name == prototype.name) {
            return Err(BackendError::AlreadyExists(format!(
                "Instance name {} already exists",
                prototype.name
            )));
        }

        let mut fake = Self::new_instance(&mut state, &prototype.name, "pending", Vec::new());
        fake.polls_left = state.boot_polls;
        let instance = fake.instance.clone();
        let delay = state.index_delay;
        if delay > 0 {
            state.hidden.insert(instance.id.clone(), delay);
        }
        state.instances.insert(instance.id.clone(), fake);

        if state.conflict_on_create {
            return Err(BackendError::AlreadyExists(format!(
                "Instance name {} already exists",
                prototype.name
            )));
        }
        Ok(instance)
    }

    async fn get_instance(&self, id: &str) -> Result<Instance, BackendError> {
        let mut state = self.state();
        Self::count(&mut state, "get_instance");
        if state.get_failures > 0 {
            state.get_failures -= 1;
            return Err(unavailable());
        }
        let fake = state
            .instances
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound("Instance not found".to_string()))?;
        if fake.instance.status == "pending" || fake.instance.status == "starting" {
            if fake.polls_left == 0 {
                fake.instance.status = "running".to_string();
            } else if fake.polls_left != u32::MAX {
                fake.polls_left -= 1;
            }
        }
        Ok(fake.instance.clone())
    }

    async fn find_instance_by_name(&self, name: &str) -> Result<Option<Instance>, BackendError> {
        let mut state = self.state();
        Self::count(&mut state, "find_instance_by_name");
        Ok(state
            .instances
            .values()
            .find(|f| f.instance.name == name)
            .map(|f| f.instance.clone()))
    }

    async fn delete_instance(&self, id: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        Self::count(&mut state, "delete_instance");
        if state.delete_failures > 0 {
            state.delete_failures -= 1;
            return Err(unavailable());
        }
        state
            .instances
            .remove(id)
            .ok_or_else(|| BackendError::NotFound("Instance not found".to_string()))?;
        state.bindings.retain(|_, instance| instance != id);
        Ok(())
    }

    async fn instance_action(&self, id: &str, action: InstanceAction) -> Result<(), BackendError> {
        if self.state().panic_on_action {
            panic!("instance action on {id} crashed");
        }
        let mut state = self.state();
        Self::count(&mut state, "instance_action");
        let fake = state
            .instances
            .get_mut(id)
            .ok_or_else(|| BackendError::NotFound("Instance not found".to_string()))?;
        fake.instance.status = match action {
            InstanceAction::Start => "starting".to_string(),
            InstanceAction::Stop => "stopped".to_string(),
        };
        Ok(())
    }

    async fn list_floating_ips(&self) -> Result<Vec<FloatingIp>, BackendError> {
        let mut state = self.state();
        Self::count(&mut state, "list_floating_ips");
        Ok(state.floating_ips.values().cloned().collect())
    }

    async fn create_floating_ip(
        &self,
        prototype: &FloatingIpPrototype,
    ) -> Result<FloatingIp, BackendError> {
        let mut state = self.state();
        Self::count(&mut state, "create_floating_ip");
        state.next_id += 1;
        let n = state.next_id;
        let fip = FloatingIp {
            id: format!("fip-{n}"),
            name: prototype.name.clone(),
            address: format!("169.48.1.{n}"),
        };
        state.floating_ips.insert(fip.id.clone(), fip.clone());
        Ok(fip)
    }

    async fn delete_floating_ip(&self, id: &str) -> Result<(), BackendError> {
        let mut state = self.state();
        Self::count(&mut state, "delete_floating_ip");
        state.bindings.remove(id);
        state
            .floating_ips
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| BackendError::NotFound("Floating IP not found".to_string()))
    }

    async fn list_interface_floating_ips(
        &self,
        instance_id: &str,
        _interface_id: &str,
    ) -> Result<Vec<FloatingIp>, BackendError> {
        Self::count(&mut self.state(), "list_interface_floating_ips");
        Ok(self.bound_floating_ips(instance_id))
    }

    async fn attach_floating_ip(
        &self,
        instance_id: &str,
        _interface_id: &str,
        floating_ip_id: &str,
    ) -> Result<FloatingIp, BackendError> {
        let mut state = self.state();
        Self::count(&mut state, "attach_floating_ip");
        let fip = state
            .floating_ips
            .get(floating_ip_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound("Floating IP not found".to_string()))?;
        state
            .bindings
            .insert(floating_ip_id.to_string(), instance_id.to_string());
        Ok(fip)
    }
}

#[async_trait]
impl TaggingApi for FakeCloud {
    async fn attach_tags(&self, crn: &str, tags: &[String]) -> Result<bool, BackendError> {
        self.tag_mutation(crn, tags, true)
    }

    async fn detach_tags(&self, crn: &str, tags: &[String]) -> Result<bool, BackendError> {
        self.tag_mutation(crn, tags, false)
    }

    async fn list_tags(&self, crn: &str) -> Result<Vec<String>, BackendError> {
        let mut state = self.state();
        Self::count(&mut state, "list_tags");
        if state.stale_lists > 0 {
            state.stale_lists -= 1;
            return Ok(Vec::new());
        }
        Ok(Self::by_crn(&mut state, crn)?.tags.clone())
    }
}

#[async_trait]
impl SearchApi for FakeCloud {
    async fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchItem>, BackendError> {
        let mut state = self.state();
        Self::count(&mut state, "search");
        if state.search_failures > 0 {
            state.search_failures -= 1;
            return Err(unavailable());
        }

        let wanted = tag_values(query);
        let mut candidates: Vec<SearchItem> = state
            .instances
            .values()
            .map(|f| {
                state
                    .frozen
                    .get(&f.instance.id)
                    .cloned()
                    .unwrap_or_else(|| search_item(f))
            })
            .collect();
        candidates.extend(state.ghosts.iter().cloned());

        let mut hidden_now = HashSet::new();
        for (id, left) in &mut state.hidden {
            if *left > 0 {
                *left -= 1;
                hidden_now.insert(id.clone());
            }
        }

        Ok(candidates
            .into_iter()
            .filter(|item| !hidden_now.contains(&item.resource_id))
            .filter(|item| wanted.iter().all(|t| item.tags.contains(t)))
            .take(limit as usize)
            .collect())
    }
}

/// Factory handing out the same fake and counting client builds.
#[derive(Debug)]
pub struct FakeFactory {
    pub cloud: Arc<FakeCloud>,
    pub compute_builds: AtomicU32,
    pub tagging_builds: AtomicU32,
    pub search_builds: AtomicU32,
}

impl FakeFactory {
    #[must_use]
    pub fn new(cloud: &Arc<FakeCloud>) -> Arc<Self> {
        Arc::new(Self {
            cloud: Arc::clone(cloud),
            compute_builds: AtomicU32::new(0),
            tagging_builds: AtomicU32::new(0),
            search_builds: AtomicU32::new(0),
        })
    }

    pub fn compute_builds(&self) -> u32 {
        self.compute_builds.load(Ordering::SeqCst)
    }

    pub fn tagging_builds(&self) -> u32 {
        self.tagging_builds.load(Ordering::SeqCst)
    }

    pub fn search_builds(&self) -> u32 {
        self.search_builds.load(Ordering::SeqCst)
    }
}

impl ClientFactory for FakeFactory {
    fn compute(&self) -> Result<Arc<dyn ComputeApi>, BackendError> {
        self.compute_builds.fetch_add(1, Ordering::SeqCst);
        let client: Arc<dyn ComputeApi> = self.cloud.clone();
        Ok(client)
    }

    fn tagging(&self) -> Result<Arc<dyn TaggingApi>, BackendError> {
        self.tagging_builds.fetch_add(1, Ordering::SeqCst);
        let client: Arc<dyn TaggingApi> = self.cloud.clone();
        Ok(client)
    }

    fn search(&self) -> Result<Arc<dyn SearchApi>, BackendError> {
        self.search_builds.fetch_add(1, Ordering::SeqCst);
        let client: Arc<dyn SearchApi> = self.cloud.clone();
        Ok(client)
    }
}

/// `key:value` tags of a node of [`CLUSTER`].
pub fn node_tags(kind: &str, status: &str) -> Vec<String> {
    vec![
        format!("{TAG_CLUSTER_NAME}:{CLUSTER}"),
        format!("{TAG_NODE_KIND}:{kind}"),
        format!("{TAG_NODE_STATUS}:{status}"),
        format!("{TAG_LAUNCH_CONFIG}:{LAUNCH_CONFIG}"),
    ]
}

/// Tags a host passes to create a node.
pub fn create_tags(kind: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert(TAG_NODE_NAME.to_string(), format!("ray-{CLUSTER}-{kind}"));
    tags.insert(TAG_NODE_KIND.to_string(), kind.to_string());
    tags.insert(TAG_NODE_STATUS.to_string(), "uninitialized".to_string());
    tags.insert(TAG_LAUNCH_CONFIG.to_string(), LAUNCH_CONFIG.to_string());
    tags
}

pub fn filter(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

pub fn template() -> NodeTemplate {
    NodeTemplate {
        vpc_id: "vpc-1".to_string(),
        subnet_id: "subnet-1".to_string(),
        security_group_id: "sg-1".to_string(),
        resource_group_id: "rg-1".to_string(),
        key_id: "key-1".to_string(),
        image_id: "img-1".to_string(),
        instance_profile_name: "cx2-2x4".to_string(),
        volume_tier_name: "general-purpose".to_string(),
        boot_volume_capacity: 100,
        head_ip: None,
    }
}

pub fn config(cache_stopped_nodes: bool) -> ProviderConfig {
    let mut config = ProviderConfig::new("http://vpc.invalid", "us-south-1");
    config.cache_stopped_nodes = cache_stopped_nodes;
    config
}

pub fn provider_with(
    cloud: &Arc<FakeCloud>,
    config: &ProviderConfig,
) -> (VpcNodeProvider, Arc<FakeFactory>) {
    let factory = FakeFactory::new(cloud);
    let provider = VpcNodeProvider::new(CLUSTER, config, factory.clone()).unwrap();
    (provider, factory)
}

pub fn provider(
    cloud: &Arc<FakeCloud>,
    cache_stopped_nodes: bool,
) -> (VpcNodeProvider, Arc<FakeFactory>) {
    provider_with(cloud, &config(cache_stopped_nodes))
}
