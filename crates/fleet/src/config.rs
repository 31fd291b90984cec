//! Cluster and provider configuration.
//!
//! Configuration is read from a YAML file shaped like:
//!
//! ```yaml
//! cluster_name: default
//! provider:
//!   endpoint: https://us-south.iaas.cloud.ibm.com
//!   iam_api_key: "..."
//!   zone_name: us-south-1
//!   cache_stopped_nodes: true
//!   use_hybrid_ips: false
//! head_node:
//!   vpc_id: r006-...
//!   subnet_id: 0717-...
//!   security_group_id: r006-...
//!   resource_group_id: 5f6b...
//!   key_id: r006-...
//!   image_id: r006-...
//! worker_node:
//!   ...
//! ```

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;

/// Default instance profile.
pub const DEFAULT_PROFILE_NAME: &str = "cx2-2x4";

/// Default boot volume tier.
pub const DEFAULT_VOLUME_TIER: &str = "general-purpose";

/// Default boot volume capacity in GB.
pub const DEFAULT_BOOT_VOLUME_CAPACITY: u32 = 100;

/// Default IAM token endpoint.
pub const DEFAULT_IAM_ENDPOINT: &str = "https://iam.cloud.ibm.com";

/// Default global tagging endpoint.
pub const DEFAULT_TAGGING_ENDPOINT: &str = "https://tags.global-search-tagging.cloud.ibm.com";

/// Default global search endpoint.
pub const DEFAULT_SEARCH_ENDPOINT: &str = "https://api.global-search-tagging.cloud.ibm.com";

static CLUSTER_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z0-9:-]+$").expect("static regex"));

/// Full cluster configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name, tagged on every node.
    pub cluster_name: String,
    /// Provider-level settings.
    pub provider: ProviderConfig,
    /// Template used for the head node.
    pub head_node: NodeTemplate,
    /// Template used for worker nodes.
    pub worker_node: NodeTemplate,
}

impl ClusterConfig {
    /// Load and validate configuration from a YAML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self, ProviderError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProviderError::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from a YAML string.
    ///
    /// # Errors
    /// Returns an error if the YAML is malformed or a required field is empty.
    pub fn from_yaml(contents: &str) -> Result<Self, ProviderError> {
        let config: Self = serde_yaml::from_str(contents)
            .map_err(|e| ProviderError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check required fields.
    ///
    /// # Errors
    /// Returns [`ProviderError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ProviderError> {
        if !CLUSTER_NAME_RE.is_match(&self.cluster_name) {
            return Err(ProviderError::Config(format!(
                "cluster_name '{}' must be non-empty lowercase alphanumerics, '-' or ':'",
                self.cluster_name
            )));
        }
        self.provider.validate()?;
        self.head_node.validate("head_node")?;
        self.worker_node.validate("worker_node")
    }
}

/// Provider-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Regional VPC endpoint, e.g. `https://us-south.iaas.cloud.ibm.com`.
    pub endpoint: String,
    /// IAM API key. May be left empty and supplied via the CLI instead.
    #[serde(default)]
    pub iam_api_key: String,
    /// Availability zone for instances and floating IPs.
    pub zone_name: String,
    /// IAM endpoint override.
    #[serde(default = "default_iam_endpoint")]
    pub iam_endpoint: String,
    /// Global tagging endpoint override.
    #[serde(default = "default_tagging_endpoint")]
    pub tagging_endpoint: String,
    /// Global search endpoint override.
    #[serde(default = "default_search_endpoint")]
    pub search_endpoint: String,
    /// Stop nodes on terminate and restart them on create instead of deleting.
    #[serde(default = "default_true")]
    pub cache_stopped_nodes: bool,
    /// Give only the head node a public address; workers report private IPs.
    #[serde(default)]
    pub use_hybrid_ips: bool,
    /// Poll intervals, delays and timeouts.
    #[serde(default)]
    pub timings: Timings,
}

impl ProviderConfig {
    /// Minimal configuration with defaults for everything optional.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, zone_name: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            iam_api_key: String::new(),
            zone_name: zone_name.into(),
            iam_endpoint: default_iam_endpoint(),
            tagging_endpoint: default_tagging_endpoint(),
            search_endpoint: default_search_endpoint(),
            cache_stopped_nodes: true,
            use_hybrid_ips: false,
            timings: Timings::default(),
        }
    }

    fn validate(&self) -> Result<(), ProviderError> {
        if self.endpoint.trim().is_empty() {
            return Err(ProviderError::Config("provider.endpoint is required".into()));
        }
        if self.zone_name.trim().is_empty() {
            return Err(ProviderError::Config("provider.zone_name is required".into()));
        }
        Ok(())
    }
}

/// Instance template (the per-node-type "node config").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTemplate {
    /// VPC to create instances in.
    pub vpc_id: String,
    /// Subnet for the primary interface.
    pub subnet_id: String,
    /// Security group for the primary interface.
    pub security_group_id: String,
    /// Resource group for instances and floating IPs.
    pub resource_group_id: String,
    /// SSH key.
    pub key_id: String,
    /// Boot image.
    pub image_id: String,
    /// Instance profile.
    #[serde(default = "default_profile_name")]
    pub instance_profile_name: String,
    /// Boot volume tier.
    #[serde(default = "default_volume_tier")]
    pub volume_tier_name: String,
    /// Boot volume capacity in GB.
    #[serde(default = "default_boot_volume_capacity")]
    pub boot_volume_capacity: u32,
    /// Existing floating IP address to reuse for the head node.
    #[serde(default)]
    pub head_ip: Option<String>,
}

impl NodeTemplate {
    fn validate(&self, section: &str) -> Result<(), ProviderError> {
        let required = [
            ("vpc_id", &self.vpc_id),
            ("subnet_id", &self.subnet_id),
            ("security_group_id", &self.security_group_id),
            ("resource_group_id", &self.resource_group_id),
            ("key_id", &self.key_id),
            ("image_id", &self.image_id),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(ProviderError::Config(format!("{section}.{field} is required")));
            }
        }
        Ok(())
    }
}

/// Fixed intervals and caps, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Interval between instance status polls.
    pub poll_interval_secs: u64,
    /// Delay before re-running a search that lost previously seen nodes.
    pub search_retry_delay_secs: u64,
    /// Delay between tag verification attempts.
    pub tag_retry_delay_secs: u64,
    /// How long an instance may stay unconfirmed before it is deleted.
    pub pending_timeout_secs: u64,
    /// Delay between top-level retries after reinitializing clients.
    pub client_retry_delay_secs: u64,
    /// Settle delay after swapping status tags.
    pub status_settle_secs: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 1,
            search_retry_delay_secs: 3,
            tag_retry_delay_secs: 5,
            pending_timeout_secs: 120,
            client_retry_delay_secs: 1,
            status_settle_secs: 1,
        }
    }
}

impl Timings {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn search_retry_delay(&self) -> Duration {
        Duration::from_secs(self.search_retry_delay_secs)
    }

    #[must_use]
    pub fn tag_retry_delay(&self) -> Duration {
        Duration::from_secs(self.tag_retry_delay_secs)
    }

    #[must_use]
    pub fn pending_timeout(&self) -> Duration {
        Duration::from_secs(self.pending_timeout_secs)
    }

    #[must_use]
    pub fn client_retry_delay(&self) -> Duration {
        Duration::from_secs(self.client_retry_delay_secs)
    }

    #[must_use]
    pub fn status_settle(&self) -> Duration {
        Duration::from_secs(self.status_settle_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_iam_endpoint() -> String {
    DEFAULT_IAM_ENDPOINT.to_string()
}

fn default_tagging_endpoint() -> String {
    DEFAULT_TAGGING_ENDPOINT.to_string()
}

fn default_search_endpoint() -> String {
    DEFAULT_SEARCH_ENDPOINT.to_string()
}

fn default_profile_name() -> String {
    DEFAULT_PROFILE_NAME.to_string()
}

fn default_volume_tier() -> String {
    DEFAULT_VOLUME_TIER.to_string()
}

fn default_boot_volume_capacity() -> u32 {
    DEFAULT_BOOT_VOLUME_CAPACITY
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"
cluster_name: default
provider:
  endpoint: https://us-south.iaas.cloud.ibm.com
  iam_api_key: secret
  zone_name: us-south-1
  use_hybrid_ips: true
  timings:
    pending_timeout_secs: 300
head_node:
  vpc_id: vpc-1
  subnet_id: subnet-1
  security_group_id: sg-1
  resource_group_id: rg-1
  key_id: key-1
  image_id: img-1
  head_ip: 169.63.1.1
worker_node:
  vpc_id: vpc-1
  subnet_id: subnet-1
  security_group_id: sg-1
  resource_group_id: rg-1
  key_id: key-1
  image_id: img-1
  instance_profile_name: bx2-8x32
";

    #[test]
    fn test_parse_applies_defaults() {
        let config = ClusterConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.cluster_name, "default");
        assert!(config.provider.cache_stopped_nodes);
        assert!(config.provider.use_hybrid_ips);
        assert_eq!(config.provider.iam_endpoint, DEFAULT_IAM_ENDPOINT);
        assert_eq!(config.provider.timings.pending_timeout_secs, 300);
        assert_eq!(config.provider.timings.tag_retry_delay_secs, 5);
        assert_eq!(config.head_node.instance_profile_name, DEFAULT_PROFILE_NAME);
        assert_eq!(config.head_node.head_ip.as_deref(), Some("169.63.1.1"));
        assert_eq!(config.worker_node.instance_profile_name, "bx2-8x32");
        assert_eq!(config.worker_node.boot_volume_capacity, 100);
        assert_eq!(config.worker_node.volume_tier_name, DEFAULT_VOLUME_TIER);
    }

    #[test]
    fn test_missing_template_field_is_rejected() {
        let broken = SAMPLE.replace("  image_id: img-1\n  head_ip", "  image_id: ''\n  head_ip");
        let err = ClusterConfig::from_yaml(&broken).unwrap_err();
        assert!(err.to_string().contains("head_node.image_id"));
    }

    #[test]
    fn test_cluster_name_charset() {
        let broken = SAMPLE.replace("cluster_name: default", "cluster_name: My_Cluster");
        assert!(matches!(
            ClusterConfig::from_yaml(&broken),
            Err(ProviderError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = ClusterConfig::load(&path).unwrap();
        assert_eq!(config.provider.zone_name, "us-south-1");

        let missing = ClusterConfig::load(&dir.path().join("absent.yaml"));
        assert!(missing.is_err());
    }
}
