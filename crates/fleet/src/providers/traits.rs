//! Backend service traits and the records they exchange.
//!
//! The node provider talks to three independent services: the compute API
//! (instances, floating IPs), the global tagging API, and the global search
//! API. None of them is transactional with the others, which is why the
//! reconciliation layer exists at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by the backend services.
#[derive(Error, Debug)]
pub enum BackendError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// A resource with the requested name already exists.
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// The account quota does not allow the request.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Authentication with the IAM service failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackendError {
    /// Whether the backend reported the resource as absent.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Network interface of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Interface identifier.
    pub id: String,
    /// Interface name (e.g. `eth0`).
    #[serde(default)]
    pub name: Option<String>,
    /// Private IPv4 address, absent until the interface is provisioned.
    #[serde(default)]
    pub primary_ipv4_address: Option<String>,
}

/// An instance record as returned by the compute API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    /// Stable instance identifier.
    pub id: String,
    /// Cloud resource name, used by the tagging service.
    pub crn: String,
    /// Instance name.
    pub name: String,
    /// Raw lifecycle status (`pending`, `running`, `stopped`, ...).
    pub status: String,
    /// Primary network interface.
    pub primary_network_interface: NetworkInterface,
    /// All network interfaces, primary first.
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
    /// Creation time.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A floating (public) IP address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIp {
    /// Floating IP identifier.
    pub id: String,
    /// Floating IP name.
    pub name: String,
    /// Public address.
    pub address: String,
}

/// Status document embedded in a search result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchDoc {
    /// Instance status at indexing time.
    #[serde(default)]
    pub status: String,
    /// Network interfaces at indexing time.
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
}

/// A resource summary returned by the search service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchItem {
    /// Instance identifier.
    pub resource_id: String,
    /// Cloud resource name.
    pub crn: String,
    /// Resource name.
    pub name: String,
    /// Attached user tags as indexed.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Indexed status document.
    #[serde(default)]
    pub doc: SearchDoc,
}

/// Identity reference used inside prototypes (`{"id": "..."}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRef {
    /// Referenced identifier.
    pub id: String,
}

/// Name reference used inside prototypes (`{"name": "..."}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameRef {
    /// Referenced name.
    pub name: String,
}

/// Boot volume definition for a new instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumePrototype {
    /// Capacity in GB.
    pub capacity: u32,
    /// Volume name.
    pub name: String,
    /// Volume profile (tier).
    pub profile: NameRef,
}

/// Boot volume attachment for a new instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootVolumeAttachment {
    /// Delete the volume together with the instance.
    pub delete_volume_on_instance_delete: bool,
    /// Volume to create.
    pub volume: VolumePrototype,
}

/// Primary interface definition for a new instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterfacePrototype {
    /// Interface name.
    pub name: String,
    /// Subnet to attach to.
    pub subnet: IdRef,
    /// Security groups applied to the interface.
    pub security_groups: Vec<IdRef>,
}

/// Request body for instance creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstancePrototype {
    /// Instance name.
    pub name: String,
    /// SSH keys.
    pub keys: Vec<IdRef>,
    /// Instance profile.
    pub profile: NameRef,
    /// Resource group.
    pub resource_group: IdRef,
    /// VPC.
    pub vpc: IdRef,
    /// Boot image.
    pub image: IdRef,
    /// Availability zone.
    pub zone: NameRef,
    /// Boot volume.
    pub boot_volume_attachment: BootVolumeAttachment,
    /// Primary network interface.
    pub primary_network_interface: NetworkInterfacePrototype,
}

/// Request body for floating IP creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloatingIpPrototype {
    /// Floating IP name.
    pub name: String,
    /// Zone to reserve the address in.
    pub zone: NameRef,
    /// Resource group.
    pub resource_group: IdRef,
}

/// Power action on an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceAction {
    /// Start a stopped instance.
    Start,
    /// Stop a running instance.
    Stop,
}

impl std::fmt::Display for InstanceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// Compute (instances and floating IPs) service.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Create an instance.
    async fn create_instance(&self, prototype: &InstancePrototype)
        -> Result<Instance, BackendError>;

    /// Get an instance by ID.
    async fn get_instance(&self, id: &str) -> Result<Instance, BackendError>;

    /// Find the instance with the given name, if any.
    async fn find_instance_by_name(&self, name: &str) -> Result<Option<Instance>, BackendError>;

    /// Delete an instance.
    async fn delete_instance(&self, id: &str) -> Result<(), BackendError>;

    /// Issue a power action.
    async fn instance_action(&self, id: &str, action: InstanceAction) -> Result<(), BackendError>;

    /// List all floating IPs visible to the account.
    async fn list_floating_ips(&self) -> Result<Vec<FloatingIp>, BackendError>;

    /// Reserve a floating IP.
    async fn create_floating_ip(
        &self,
        prototype: &FloatingIpPrototype,
    ) -> Result<FloatingIp, BackendError>;

    /// Release a floating IP.
    async fn delete_floating_ip(&self, id: &str) -> Result<(), BackendError>;

    /// List floating IPs bound to an instance network interface.
    async fn list_interface_floating_ips(
        &self,
        instance_id: &str,
        interface_id: &str,
    ) -> Result<Vec<FloatingIp>, BackendError>;

    /// Bind a floating IP to an instance network interface.
    async fn attach_floating_ip(
        &self,
        instance_id: &str,
        interface_id: &str,
        floating_ip_id: &str,
    ) -> Result<FloatingIp, BackendError>;
}

/// Global tagging service.
///
/// Mutating calls return `Ok(false)` when the request went through but the
/// backend flagged the operation as failed for the resource.
#[async_trait]
pub trait TaggingApi: Send + Sync {
    /// Attach user tags to a resource.
    async fn attach_tags(&self, crn: &str, tags: &[String]) -> Result<bool, BackendError>;

    /// Detach user tags from a resource.
    async fn detach_tags(&self, crn: &str, tags: &[String]) -> Result<bool, BackendError>;

    /// List user tags attached to a resource.
    async fn list_tags(&self, crn: &str) -> Result<Vec<String>, BackendError>;
}

/// Global search service.
#[async_trait]
pub trait SearchApi: Send + Sync {
    /// Run a search query, returning at most `limit` items.
    async fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchItem>, BackendError>;
}
