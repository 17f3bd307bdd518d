//! Per-level view model: navigation, color resolution, tile inflation and
//! layout, producing exactly what a frontend draws.

use serde::Serialize;

use crate::colors::{contrast_text_color, DEFAULT_TILE_COLOR};
use crate::grouping::{aggregate_others, domain_level};
use crate::models::{CountFilter, DomainColors, DomainNode, HierarchyNode, NodeKind, OTHERS_ID};
use crate::treemap::{squarify, Placed, Rect};

/// Smallest share of a level a tile is drawn at, in units of 1/200
/// (`3` = 1.5%). Integer so the floor test is exact.
const MIN_TILE_SHARE_NUM: u64 = 3;
const MIN_TILE_SHARE_DEN: u64 = 200;

// ---------------------------------------------------------------------------
// Tile inflation
// ---------------------------------------------------------------------------

/// Layout weights for a level of true counts.
///
/// With more than one sibling, any count under 1.5% of the level total is
/// raised to `ceil(1.5% × total)`. Counts themselves are never touched; the
/// returned weights only feed the layout.
pub fn visual_weights(counts: &[u64]) -> Vec<u64> {
    let total: u64 = counts.iter().sum();
    if counts.len() <= 1 || total == 0 {
        return counts.to_vec();
    }
    let floor = (total * MIN_TILE_SHARE_NUM).div_ceil(MIN_TILE_SHARE_DEN);
    counts
        .iter()
        .map(|&count| {
            if count * MIN_TILE_SHARE_DEN < total * MIN_TILE_SHARE_NUM {
                count.max(floor)
            } else {
                count
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// View model
// ---------------------------------------------------------------------------

/// One laid-out rectangle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tile {
    pub id: String,
    pub name: String,
    pub kind: NodeKind,
    /// True message count under the active filter.
    pub count: u64,
    pub color: String,
    pub favicon_url: Option<String>,
    pub text_color: &'static str,
    pub rect: Rect,
    pub is_others: bool,
    /// The node itself, for drilling down.
    #[serde(skip)]
    pub node: HierarchyNode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Breadcrumb {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreemapView {
    pub tiles: Vec<Tile>,
    pub total_count: u64,
    pub breadcrumbs: Vec<Breadcrumb>,
}

/// Resolve `path` against `hierarchy` and lay out the level it lands on.
///
/// Each path entry is a node id at the current level; [`OTHERS_ID`] steps
/// into the Others bucket as recomputed for that level. Ids that match
/// nothing are skipped. Only the top level is bucketed for display, so
/// drilling keeps every member visible.
pub fn build_treemap_view(
    hierarchy: &[DomainNode],
    colors: &DomainColors,
    path: &[String],
    filter: CountFilter,
    others_label: &str,
) -> TreemapView {
    let mut level = domain_level(hierarchy);
    let mut inherited: Option<String> = None;
    let mut breadcrumbs = Vec::new();

    for id in path {
        if id == OTHERS_ID {
            let bucket = aggregate_others(level.clone(), filter, others_label)
                .into_iter()
                .find(HierarchyNode::is_others);
            if let Some(bucket) = bucket {
                breadcrumbs.push(Breadcrumb {
                    id: bucket.id().to_string(),
                    name: bucket.name().to_string(),
                });
                level = bucket.child_nodes();
                continue;
            }
        }

        let Some(found) = level.iter().find(|n| n.id() == id).cloned() else {
            log::debug!("Skipping unknown path entry {id}");
            continue;
        };
        breadcrumbs.push(Breadcrumb {
            id: found.id().to_string(),
            name: found.name().to_string(),
        });
        if let Some(info) = colors.get(found.id()) {
            inherited = Some(info.color.clone());
        }
        level = found.child_nodes();
    }

    let level = if path.is_empty() {
        aggregate_others(level, filter, others_label)
    } else {
        level
    };

    let mut counted: Vec<(HierarchyNode, u64)> = level
        .into_iter()
        .map(|node| {
            let count = node.count(filter);
            (node, count)
        })
        .filter(|(_, count)| *count > 0)
        .collect();
    counted.sort_by(|a, b| b.1.cmp(&a.1));

    let counts: Vec<u64> = counted.iter().map(|(_, c)| *c).collect();
    let total_count = counts.iter().sum();
    let weights = visual_weights(&counts);

    let items: Vec<(HierarchyNode, u64, u64)> = counted
        .into_iter()
        .zip(weights)
        .map(|((node, count), weight)| (node, count, weight))
        .collect();

    let tiles = squarify(items, |(_, _, weight)| *weight as f64, Rect::FULL)
        .into_iter()
        .map(|Placed { item: (node, count, _), rect }| {
            let info = colors.get(node.id());
            let color = info
                .map(|i| i.color.clone())
                .or_else(|| inherited.clone())
                .unwrap_or_else(|| DEFAULT_TILE_COLOR.to_string());
            Tile {
                id: node.id().to_string(),
                name: node.name().to_string(),
                kind: node.kind(),
                count,
                text_color: contrast_text_color(&color),
                favicon_url: info.and_then(|i| i.favicon_url.clone()),
                color,
                rect,
                is_others: node.is_others(),
                node,
            }
        })
        .collect();

    TreemapView {
        tiles,
        total_count,
        breadcrumbs,
    }
}
