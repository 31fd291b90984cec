//! Node records, roles, statuses and the tag vocabulary.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ProviderError;
use crate::providers::{Instance, NetworkInterface, SearchItem};

/// Tag key holding the cluster name.
pub const TAG_CLUSTER_NAME: &str = "ray-cluster-name";
/// Tag key holding the node role (`head` / `worker`).
pub const TAG_NODE_KIND: &str = "ray-node-type";
/// Tag key holding the node name.
pub const TAG_NODE_NAME: &str = "ray-node-name";
/// Tag key holding the launch configuration hash.
pub const TAG_LAUNCH_CONFIG: &str = "ray-launch-config";
/// Tag key holding the node lifecycle status.
pub const TAG_NODE_STATUS: &str = "ray-node-status";
/// Tag key holding the user-defined node type.
pub const TAG_USER_NODE_TYPE: &str = "ray-user-node-type";

/// Maximum instance name length accepted by the backend.
pub const INSTANCE_NAME_MAX_LEN: usize = 64;
/// Length of the random suffix appended to instance names.
pub const INSTANCE_NAME_SUFFIX_LEN: usize = 8;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z0-9:-]*$").expect("static regex"));

/// Tag filters, ordered by key so queries are deterministic.
pub type TagFilter = BTreeMap<String, String>;

/// Role of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// The single head node.
    Head,
    /// A worker node.
    Worker,
}

impl NodeRole {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::Worker => "worker",
        }
    }

    /// Role from a `ray-node-type` tag among `k:v` tags.
    #[must_use]
    pub fn from_tags(tags: &[String]) -> Option<Self> {
        tags.iter()
            .filter_map(|t| split_tag(t))
            .find(|(k, _)| *k == TAG_NODE_KIND)
            .and_then(|(_, v)| v.parse().ok())
    }

    /// Role inferred from an instance name (`...<cluster>-head...`).
    ///
    /// Create and tag are separate calls, so the name is the only role marker
    /// an untagged instance carries.
    #[must_use]
    pub fn from_name(name: &str, cluster_name: &str) -> Option<Self> {
        if name.contains(&format!("{cluster_name}-worker")) {
            Some(Self::Worker)
        } else if name.contains(&format!("{cluster_name}-head")) {
            Some(Self::Head)
        } else {
            None
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeRole {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "head" => Ok(Self::Head),
            "worker" => Ok(Self::Worker),
            other => Err(ProviderError::Config(format!("unknown node role '{other}'"))),
        }
    }
}

/// Instance lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Any status the provider does not track explicitly.
    #[serde(other)]
    Unknown,
}

impl NodeStatus {
    /// Parse a backend status string. Unrecognized values map to `Unknown`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            _ => Self::Unknown,
        }
    }

    /// Pending, starting or running: the node counts as non-terminated.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Pending | Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Mutually exclusive `ray-node-status` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusTag {
    Uninitialized,
    WaitingForSsh,
    SettingUp,
    SyncingFiles,
    UpToDate,
    UpdateFailed,
}

impl StatusTag {
    /// Every status value, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Uninitialized,
        Self::WaitingForSsh,
        Self::SettingUp,
        Self::SyncingFiles,
        Self::UpToDate,
        Self::UpdateFailed,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::WaitingForSsh => "waiting-for-ssh",
            Self::SettingUp => "setting-up",
            Self::SyncingFiles => "syncing-files",
            Self::UpToDate => "up-to-date",
            Self::UpdateFailed => "update-failed",
        }
    }

    /// The `ray-node-status:<value>` tag.
    #[must_use]
    pub fn tag(&self) -> String {
        format!("{TAG_NODE_STATUS}:{}", self.as_str())
    }

    /// Tags of every other status value.
    #[must_use]
    pub fn others(&self) -> Vec<String> {
        Self::ALL
            .iter()
            .filter(|s| *s != self)
            .map(StatusTag::tag)
            .collect()
    }
}

impl std::fmt::Display for StatusTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusTag {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ProviderError::Config(format!("unknown node status '{s}'")))
    }
}

/// A tracked compute instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Stable backend identifier.
    pub id: String,
    /// Resource reference used for tagging.
    pub crn: String,
    /// Instance name.
    pub name: String,
    /// Last known status.
    pub status: NodeStatus,
    /// Private address of the primary interface.
    pub private_ip: Option<String>,
    /// Floating (public) addresses.
    #[serde(default)]
    pub floating_ips: Vec<String>,
    /// Attached `key:value` tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Head or worker.
    pub role: NodeRole,
    /// Set while the node is created but not yet confirmed by search.
    #[serde(skip)]
    pub pending_since: Option<Instant>,
}

impl Node {
    /// Build a node from an authoritative instance record.
    #[must_use]
    pub fn from_instance(instance: &Instance, role: NodeRole, tags: Vec<String>) -> Self {
        Self {
            id: instance.id.clone(),
            crn: instance.crn.clone(),
            name: instance.name.clone(),
            status: NodeStatus::parse(&instance.status),
            private_ip: primary_ipv4(instance),
            floating_ips: Vec::new(),
            tags,
            role,
            pending_since: None,
        }
    }

    /// Build a node from a search hit, preferring the authoritative instance
    /// record for status and addresses.
    #[must_use]
    pub fn from_search(item: &SearchItem, instance: &Instance, cluster_name: &str) -> Self {
        let role = NodeRole::from_tags(&item.tags)
            .or_else(|| NodeRole::from_name(&item.name, cluster_name))
            .unwrap_or(NodeRole::Worker);
        let mut node = Self::from_instance(instance, role, item.tags.clone());
        if node.private_ip.is_none() {
            node.private_ip = item
                .doc
                .network_interfaces
                .first()
                .and_then(|nic| nic.primary_ipv4_address.clone());
        }
        node
    }

    /// Tags as a map, with the cluster, role and name synthesized from the
    /// instance name when it belongs to `cluster_name`.
    #[must_use]
    pub fn tag_map(&self, cluster_name: &str) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        if !self.name.contains(cluster_name) {
            return map;
        }
        map.insert(TAG_CLUSTER_NAME.to_string(), cluster_name.to_string());
        let role = NodeRole::from_name(&self.name, cluster_name).unwrap_or(NodeRole::Head);
        map.insert(TAG_NODE_KIND.to_string(), role.to_string());
        map.insert(TAG_NODE_NAME.to_string(), self.name.clone());
        for (k, v) in self.tags.iter().filter_map(|t| split_tag(t)) {
            map.insert(k.to_string(), v.to_string());
        }
        map
    }
}

fn primary_ipv4(instance: &Instance) -> Option<String> {
    instance
        .primary_network_interface
        .primary_ipv4_address
        .clone()
        .or_else(|| {
            instance
                .network_interfaces
                .first()
                .and_then(|nic: &NetworkInterface| nic.primary_ipv4_address.clone())
        })
}

/// Split a `key:value` tag at its first colon.
#[must_use]
pub fn split_tag(tag: &str) -> Option<(&str, &str)> {
    tag.split_once(':')
}

/// Render tag map entries as `key:value` strings.
#[must_use]
pub fn tags_to_list(tags: &BTreeMap<String, String>) -> Vec<String> {
    tags.iter().map(|(k, v)| format!("{k}:{v}")).collect()
}

/// Build the search query for a cluster and tag filter.
///
/// ```text
/// tags:"ray-cluster-name:c1" AND tags:"ray-node-type:worker"
/// ```
#[must_use]
pub fn build_query(cluster_name: &str, filter: &TagFilter) -> String {
    let mut query = format!("tags:\"{TAG_CLUSTER_NAME}:{cluster_name}\"");
    for (k, v) in filter {
        query.push_str(&format!(" AND tags:\"{k}:{v}\""));
    }
    query
}

/// Append a random suffix to a base node name, enforcing length and charset.
///
/// # Errors
/// Returns [`ProviderError::InvalidNodeName`] when the base name is too long
/// or contains characters outside `[a-z0-9:-]`.
pub fn instance_name(base: &str) -> Result<String, ProviderError> {
    let max = INSTANCE_NAME_MAX_LEN - INSTANCE_NAME_SUFFIX_LEN - 1;
    if base.len() > max {
        return Err(ProviderError::InvalidNodeName {
            name: base.to_string(),
            reason: format!("length {} exceeds {max}", base.len()),
        });
    }
    if !NAME_RE.is_match(base) {
        return Err(ProviderError::InvalidNodeName {
            name: base.to_string(),
            reason: "only lowercase alphanumerics, '-' and ':' are allowed".to_string(),
        });
    }
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    Ok(format!("{base}-{}", &suffix[..INSTANCE_NAME_SUFFIX_LEN]))
}
