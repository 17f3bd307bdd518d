//! Flat records → domain/subdomain/sender tree, and the long-tail "Others"
//! bucketing applied per displayed level.

use indexmap::IndexMap;

use crate::models::{
    CountFilter, DomainNode, HierarchyNode, MessageRecord, OthersNode, SenderNode, SubdomainNode,
    OTHERS_ID,
};

/// Share of the level total below which a sibling goes into "Others".
pub const OTHERS_THRESHOLD: f64 = 0.02;

/// Bucketing only kicks in when a level has more siblings than this.
const OTHERS_MIN_SIBLINGS: usize = 3;

/// Public suffixes that need three labels to form a registrable domain.
const DOUBLE_SUFFIXES: &[&str] = &["co.uk", "co.jp", "com.au", "com.br", "co.in", "co.za"];

/// Registrable domain of an address: `alice@mail.noreply.github.com` → `github.com`.
///
/// Strings without `@` are returned whole.
pub fn extract_root_domain(address: &str) -> String {
    let Some(at) = address.rfind('@') else {
        return address.to_string();
    };
    let full = address[at + 1..].to_lowercase();
    let labels: Vec<&str> = full.split('.').collect();
    if labels.len() <= 2 {
        return full;
    }

    let last_two = labels[labels.len() - 2..].join(".");
    if DOUBLE_SUFFIXES.contains(&last_two.as_str()) {
        return labels[labels.len() - 3..].join(".");
    }
    last_two
}

/// Lowercased host part, untruncated: `alice@mail.noreply.github.com` →
/// `mail.noreply.github.com`.
pub fn extract_full_domain(address: &str) -> String {
    match address.rfind('@') {
        Some(at) => address[at + 1..].to_lowercase(),
        None => address.to_string(),
    }
}

/// Build the three-level tree. Every level keeps first-seen order.
pub fn group_records(records: &[MessageRecord]) -> Vec<DomainNode> {
    type Senders = IndexMap<String, SenderNode>;
    let mut domains: IndexMap<String, IndexMap<String, Senders>> = IndexMap::new();

    for record in records {
        let root = extract_root_domain(&record.from);
        let full = extract_full_domain(&record.from);
        let sender_key = record.from.to_lowercase();

        let sender = domains
            .entry(root)
            .or_default()
            .entry(full)
            .or_default()
            .entry(sender_key.clone())
            .or_insert_with(|| SenderNode {
                name: if record.name.is_empty() {
                    sender_key.clone()
                } else {
                    record.name.clone()
                },
                id: sender_key,
                unread: 0,
                read: 0,
            });

        if record.unread {
            sender.unread += 1;
        } else {
            sender.read += 1;
        }
    }

    domains
        .into_iter()
        .map(|(root, subdomains)| DomainNode {
            name: root.clone(),
            id: root,
            children: subdomains
                .into_iter()
                .map(|(sub, senders)| SubdomainNode {
                    name: sub.clone(),
                    id: sub,
                    children: senders.into_values().collect(),
                })
                .collect(),
        })
        .collect()
}

/// Collapse siblings below [`OTHERS_THRESHOLD`] into one "Others" node.
///
/// Input comes back unchanged when the level is empty or zero under `filter`,
/// has too few siblings, or fewer than two siblings qualify. Otherwise the
/// non-qualifying siblings keep their order and the bucket is appended last.
pub fn aggregate_others(
    nodes: Vec<HierarchyNode>,
    filter: CountFilter,
    label: &str,
) -> Vec<HierarchyNode> {
    let counts: Vec<u64> = nodes.iter().map(|n| n.count(filter)).collect();
    let total: u64 = counts.iter().sum();
    if total == 0 || nodes.len() <= OTHERS_MIN_SIBLINGS {
        return nodes;
    }

    let qualifies: Vec<bool> = counts
        .iter()
        .map(|&c| (c as f64 / total as f64) < OTHERS_THRESHOLD)
        .collect();
    if qualifies.iter().filter(|q| **q).count() < 2 {
        return nodes;
    }

    let mut main = Vec::with_capacity(nodes.len());
    let mut tail = Vec::new();
    for (node, small) in nodes.into_iter().zip(qualifies) {
        if small {
            tail.push(node);
        } else {
            main.push(node);
        }
    }

    main.push(HierarchyNode::Others(OthersNode {
        id: OTHERS_ID.to_string(),
        name: label.to_string(),
        children: tail,
    }));
    main
}

/// Depth-first search across every level.
pub fn find_node_by_id(nodes: &[HierarchyNode], id: &str) -> Option<HierarchyNode> {
    for node in nodes {
        if node.id() == id {
            return Some(node.clone());
        }
        let children = node.child_nodes();
        if let Some(found) = find_node_by_id(&children, id) {
            return Some(found);
        }
    }
    None
}

/// Wrap typed domain nodes as a navigation level.
pub fn domain_level(domains: &[DomainNode]) -> Vec<HierarchyNode> {
    domains.iter().cloned().map(HierarchyNode::Domain).collect()
}
