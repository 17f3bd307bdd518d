use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Id of the synthetic bucket that wraps long-tail siblings.
pub const OTHERS_ID: &str = "__others__";

/// One fetched message, reduced to what the treemap needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    /// Sender address as parsed from the `From` header.
    pub from: String,
    /// Display name, or the address when the header had none.
    pub name: String,
    pub unread: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Which messages contribute to a tile's size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountFilter {
    #[default]
    All,
    Unread,
}

// ---------------------------------------------------------------------------
// Hierarchy: domain → subdomain → sender
// ---------------------------------------------------------------------------

/// Root registrable domain (`github.com`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainNode {
    pub id: String,
    pub name: String,
    pub children: Vec<SubdomainNode>,
}

/// Full sending host (`mail.noreply.github.com`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubdomainNode {
    pub id: String,
    pub name: String,
    pub children: Vec<SenderNode>,
}

/// Leaf: one lowercased sender address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderNode {
    pub id: String,
    pub name: String,
    pub unread: u64,
    pub read: u64,
}

/// Synthetic bucket holding at least two long-tail siblings of one level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OthersNode {
    pub id: String,
    pub name: String,
    pub children: Vec<HierarchyNode>,
}

/// Any node that can appear as a sibling at one navigation level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HierarchyNode {
    Domain(DomainNode),
    Subdomain(SubdomainNode),
    Sender(SenderNode),
    Others(OthersNode),
}

impl SenderNode {
    pub fn count(&self, filter: CountFilter) -> u64 {
        match filter {
            CountFilter::All => self.unread + self.read,
            CountFilter::Unread => self.unread,
        }
    }
}

impl SubdomainNode {
    pub fn count(&self, filter: CountFilter) -> u64 {
        self.children.iter().map(|s| s.count(filter)).sum()
    }
}

impl DomainNode {
    pub fn count(&self, filter: CountFilter) -> u64 {
        self.children.iter().map(|s| s.count(filter)).sum()
    }
}

impl HierarchyNode {
    pub fn id(&self) -> &str {
        match self {
            Self::Domain(n) => &n.id,
            Self::Subdomain(n) => &n.id,
            Self::Sender(n) => &n.id,
            Self::Others(n) => &n.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Domain(n) => &n.name,
            Self::Subdomain(n) => &n.name,
            Self::Sender(n) => &n.name,
            Self::Others(n) => &n.name,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Domain(_) => NodeKind::Domain,
            Self::Subdomain(_) => NodeKind::Subdomain,
            Self::Sender(_) => NodeKind::Sender,
            Self::Others(_) => NodeKind::Others,
        }
    }

    pub fn is_others(&self) -> bool {
        matches!(self, Self::Others(_))
    }

    /// Recursive leaf sum under the given filter.
    pub fn count(&self, filter: CountFilter) -> u64 {
        match self {
            Self::Domain(n) => n.count(filter),
            Self::Subdomain(n) => n.count(filter),
            Self::Sender(n) => n.count(filter),
            Self::Others(n) => n.children.iter().map(|c| c.count(filter)).sum(),
        }
    }

    /// The next navigation level below this node. Senders have none.
    pub fn child_nodes(&self) -> Vec<HierarchyNode> {
        match self {
            Self::Domain(n) => n
                .children
                .iter()
                .cloned()
                .map(HierarchyNode::Subdomain)
                .collect(),
            Self::Subdomain(n) => n
                .children
                .iter()
                .cloned()
                .map(HierarchyNode::Sender)
                .collect(),
            Self::Sender(_) => Vec::new(),
            Self::Others(n) => n.children.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Domain,
    Subdomain,
    Sender,
    Others,
}

// ---------------------------------------------------------------------------
// Colors
// ---------------------------------------------------------------------------

/// Tile color for one root domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainColorInfo {
    /// `#rrggbb`
    pub color: String,
    pub favicon_url: Option<String>,
}

/// Keyed by [`DomainNode::id`].
pub type DomainColors = HashMap<String, DomainColorInfo>;

// ---------------------------------------------------------------------------
// Sync state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Idle,
    Restoring,
    Fetching,
    Processing,
    Done,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    Listing,
    Fetching,
    Updating,
    Processing,
    Restoring,
}

/// Everything a frontend renders from. Hierarchy and records are replaced
/// wholesale on every change, never patched.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    pub status: SyncStatus,
    pub progress: usize,
    pub progress_phase: Option<ProgressPhase>,
    pub records: std::sync::Arc<Vec<MessageRecord>>,
    pub hierarchy: std::sync::Arc<Vec<DomainNode>>,
    pub domain_colors: DomainColors,
    pub error: Option<String>,
}
