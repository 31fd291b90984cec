//! VPC, tagging, search and IAM request/response envelopes.

use serde::{Deserialize, Serialize};

use crate::providers::traits::{FloatingIp, Instance, InstanceAction, SearchItem};

// ============================================================================
// Errors
// ============================================================================

/// Error body shared by the VPC and platform APIs.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
    /// Error details.
    #[serde(default)]
    pub errors: Vec<ApiErrorDetail>,
}

/// Individual error detail.
#[derive(Debug, Deserialize)]
pub struct ApiErrorDetail {
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

// ============================================================================
// IAM
// ============================================================================

/// IAM token exchange response.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    /// Bearer token.
    pub access_token: String,
    /// Lifetime in seconds.
    pub expires_in: i64,
}

// ============================================================================
// Compute
// ============================================================================

/// `GET /instances` response.
#[derive(Debug, Deserialize)]
pub struct InstanceCollection {
    /// Instances on this page.
    #[serde(default)]
    pub instances: Vec<Instance>,
}

/// Floating IP list response.
#[derive(Debug, Deserialize)]
pub struct FloatingIpCollection {
    /// Floating IPs on this page.
    #[serde(default)]
    pub floating_ips: Vec<FloatingIp>,
}

/// `POST /instances/{id}/actions` body.
#[derive(Debug, Serialize)]
pub struct ActionRequest {
    /// Action to run.
    #[serde(rename = "type")]
    pub action: InstanceAction,
}

// ============================================================================
// Tagging
// ============================================================================

/// Resource reference in a tag request.
#[derive(Debug, Serialize)]
pub struct TagResource {
    /// Resource CRN.
    pub resource_id: String,
}

/// Attach/detach request body.
#[derive(Debug, Serialize)]
pub struct TagRequest {
    /// Resources to tag.
    pub resources: Vec<TagResource>,
    /// Tags to attach or detach.
    pub tag_names: Vec<String>,
}

/// Attach/detach response.
#[derive(Debug, Deserialize)]
pub struct TagResults {
    /// One result per resource.
    #[serde(default)]
    pub results: Vec<TagResult>,
}

/// Per-resource tag operation result.
#[derive(Debug, Deserialize)]
pub struct TagResult {
    /// Resource CRN.
    #[serde(default)]
    pub resource_id: Option<String>,
    /// Whether the operation failed for this resource.
    #[serde(default)]
    pub is_error: bool,
}

/// `GET /tags` response.
#[derive(Debug, Deserialize)]
pub struct TagList {
    /// Attached tags.
    #[serde(default)]
    pub items: Vec<TagName>,
}

/// A listed tag.
#[derive(Debug, Deserialize)]
pub struct TagName {
    /// `key:value` tag.
    pub name: String,
}

// ============================================================================
// Search
// ============================================================================

/// `POST /resources/search` body.
#[derive(Debug, Serialize)]
pub struct SearchRequest {
    /// Lucene-style query.
    pub query: String,
    /// Fields to include in each item.
    pub fields: Vec<String>,
}

/// `POST /resources/search` response.
#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    /// Matching resources.
    #[serde(default)]
    pub items: Vec<SearchItem>,
}
