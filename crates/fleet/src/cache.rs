//! In-process node state.
//!
//! All four scopes live in one [`NodeCache`] guarded by a single async mutex
//! ([`SharedCache`]). A reconciliation pass holds the guard across its backend
//! calls, so the decision of what went missing and the cache mutation that
//! follows are never interleaved with another pass.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::node::{Node, TagFilter};

/// Cache handle shared by the reconciler, orchestrator and provider.
pub type SharedCache = Arc<Mutex<NodeCache>>;

/// Key of a previously-seen id set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SeenScope {
    /// Head nodes, shared by every head-role query.
    Head,
    /// Nodes returned by one specific query string.
    Query(String),
}

/// A created instance not yet confirmed by search.
#[derive(Debug, Clone)]
pub struct PendingNode {
    /// Node as known at creation time (tags still incomplete).
    pub node: Node,
    /// Tags the node is going to carry, used to match filters meanwhile.
    pub intended_tags: Vec<String>,
}

impl PendingNode {
    /// Whether the node will satisfy `filter` once its tags land.
    #[must_use]
    pub fn matches(&self, filter: &TagFilter) -> bool {
        filter
            .iter()
            .all(|(k, v)| self.intended_tags.iter().any(|t| *t == format!("{k}:{v}")))
    }
}

/// Node cache scopes.
#[derive(Debug, Default)]
pub struct NodeCache {
    cached: HashMap<String, Node>,
    pending: BTreeMap<String, PendingNode>,
    seen: HashMap<SeenScope, HashSet<String>>,
    deleted: HashSet<String>,
}

impl NodeCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// New cache wrapped for sharing.
    #[must_use]
    pub fn shared() -> SharedCache {
        Arc::new(Mutex::new(Self::new()))
    }

    // ------------------------------------------------------------------
    // cached nodes
    // ------------------------------------------------------------------

    #[must_use]
    pub fn cached(&self, id: &str) -> Option<&Node> {
        self.cached.get(id)
    }

    /// Store a reconciled node. Deleted ids are never reinstated.
    pub fn upsert_cached(&mut self, node: Node) {
        if self.deleted.contains(&node.id) {
            debug!(node_id = %node.id, "Ignoring cache update for deleted node");
            return;
        }
        self.cached.insert(node.id.clone(), node);
    }

    pub fn remove_cached(&mut self, id: &str) -> Option<Node> {
        self.cached.remove(id)
    }

    // ------------------------------------------------------------------
    // pending nodes
    // ------------------------------------------------------------------

    /// Register a freshly created node as pending since `since`.
    pub fn add_pending(&mut self, mut node: Node, intended_tags: Vec<String>, since: Instant) {
        node.pending_since = Some(since);
        debug!(node_id = %node.id, "Tracking pending node");
        self.pending.insert(
            node.id.clone(),
            PendingNode {
                node,
                intended_tags,
            },
        );
    }

    /// Restart the pending clock, e.g. once the instance is running and
    /// tagging begins.
    pub fn touch_pending(&mut self, id: &str, now: Instant) {
        if let Some(entry) = self.pending.get_mut(id) {
            entry.node.pending_since = Some(now);
        }
    }

    #[must_use]
    pub fn pending(&self, id: &str) -> Option<&PendingNode> {
        self.pending.get(id)
    }

    #[must_use]
    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    /// Pending entries ordered by id.
    #[must_use]
    pub fn pending_nodes(&self) -> Vec<PendingNode> {
        self.pending.values().cloned().collect()
    }

    pub fn remove_pending(&mut self, id: &str) -> Option<PendingNode> {
        self.pending.remove(id)
    }

    // ------------------------------------------------------------------
    // previously seen sets
    // ------------------------------------------------------------------

    /// Ids seen by the last clean pass in `scope`.
    #[must_use]
    pub fn seen(&self, scope: &SeenScope) -> HashSet<String> {
        self.seen.get(scope).cloned().unwrap_or_default()
    }

    pub fn record_seen(&mut self, scope: SeenScope, id: &str) {
        self.seen.entry(scope).or_default().insert(id.to_string());
    }

    pub fn forget_seen_in(&mut self, scope: &SeenScope, id: &str) {
        if let Some(ids) = self.seen.get_mut(scope) {
            ids.remove(id);
        }
    }

    /// Drop `id` from every previously-seen set.
    pub fn forget_seen(&mut self, id: &str) {
        for ids in self.seen.values_mut() {
            ids.remove(id);
        }
    }

    // ------------------------------------------------------------------
    // deleted ids
    // ------------------------------------------------------------------

    /// Record an explicit termination and purge the id from every other scope.
    pub fn mark_deleted(&mut self, id: &str) {
        self.deleted.insert(id.to_string());
        self.forget_seen(id);
        self.cached.remove(id);
        self.pending.remove(id);
    }

    #[must_use]
    pub fn is_deleted(&self, id: &str) -> bool {
        self.deleted.contains(id)
    }

    /// Allow a previously terminated (stopped) node to be tracked again.
    pub fn undelete(&mut self, id: &str) -> bool {
        self.deleted.remove(id)
    }
}
