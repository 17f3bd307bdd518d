//! Squarified treemap layout (Bruls, Huizing, van Wijk).
//!
//! Coordinates are percentages of the container on each axis, so the default
//! bounds are `0..100 × 0..100` regardless of the rendered aspect.
//!
//! Candidate rows are scored on the slab they would actually occupy: its
//! thickness is the row's share of the remaining total times the long edge.
//! Scoring against the short side instead picks different rows on
//! non-square remainders. Areas stay proportional to weights either way.

use serde::{Deserialize, Serialize};

/// Axis-aligned rectangle in container percentages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    /// The whole container.
    pub const FULL: Rect = Rect {
        x: 0.0,
        y: 0.0,
        width: 100.0,
        height: 100.0,
    };

    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    fn is_wide(&self) -> bool {
        self.width >= self.height
    }
}

/// An input item with its assigned rectangle.
#[derive(Debug, Clone, PartialEq)]
pub struct Placed<T> {
    pub item: T,
    pub rect: Rect,
}

/// Lay `items` out inside `bounds`, area proportional to `weight`.
///
/// Output is ordered by descending weight. Empty input, or input whose total
/// weight is not positive, yields an empty layout; a single item always fills
/// `bounds`.
pub fn squarify<T, F>(items: Vec<T>, weight: F, bounds: Rect) -> Vec<Placed<T>>
where
    F: Fn(&T) -> f64,
{
    if items.len() == 1 {
        return items
            .into_iter()
            .map(|item| Placed { item, rect: bounds })
            .collect();
    }

    let mut weighted: Vec<(f64, T)> = items
        .into_iter()
        .map(|item| (sanitize(weight(&item)), item))
        .collect();
    let total: f64 = weighted.iter().map(|(w, _)| w).sum();
    if weighted.is_empty() || total <= 0.0 {
        return Vec::new();
    }

    // Stable, so equal weights keep input order.
    weighted.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut out = Vec::with_capacity(weighted.len());
    let mut rest = bounds;
    let mut remaining = weighted;

    while !remaining.is_empty() {
        if remaining.len() == 1 {
            if let Some((_, item)) = remaining.pop() {
                out.push(Placed { item, rect: rest });
            }
            break;
        }

        let weights: Vec<f64> = remaining.iter().map(|(w, _)| *w).collect();
        let remaining_total: f64 = weights.iter().sum();
        if remaining_total <= 0.0 {
            // Only zero-weight stragglers left; they get no area.
            for (_, item) in remaining.drain(..) {
                out.push(Placed {
                    item,
                    rect: Rect::new(rest.x, rest.y, 0.0, 0.0),
                });
            }
            break;
        }

        let row_len = best_row_len(&weights, remaining_total, rest);
        let row_total: f64 = weights[..row_len].iter().sum();
        let (slab, next) = split_slab(rest, row_total / remaining_total);

        let tail = remaining.split_off(row_len);
        place_row(remaining, row_total, slab, rest.is_wide(), &mut out);
        remaining = tail;
        rest = next;
    }

    out
}

/// Grow the row while its worst aspect ratio does not get worse.
///
/// Candidate sizes run from 1 to `n - 1`; whatever is left over is laid out
/// against the remaining rectangle.
fn best_row_len(weights: &[f64], total: f64, bounds: Rect) -> usize {
    let mut best_len = 1;
    let mut best_worst = worst_aspect_ratio(&weights[..1], total, bounds);
    for len in 2..weights.len() {
        let worst = worst_aspect_ratio(&weights[..len], total, bounds);
        if worst > best_worst {
            break;
        }
        best_len = len;
        best_worst = worst;
    }
    best_len
}

/// Largest `max(w/h, h/w)` among the items of a candidate row.
fn worst_aspect_ratio(row: &[f64], total: f64, bounds: Rect) -> f64 {
    let (side, long) = if bounds.is_wide() {
        (bounds.height, bounds.width)
    } else {
        (bounds.width, bounds.height)
    };
    let row_total: f64 = row.iter().sum();
    if row_total <= 0.0 {
        return f64::INFINITY;
    }
    let thickness = row_total / total * long;

    row.iter()
        .map(|w| {
            let length = w / row_total * side;
            if thickness <= 0.0 || length <= 0.0 {
                f64::INFINITY
            } else {
                (thickness / length).max(length / thickness)
            }
        })
        .fold(0.0, f64::max)
}

/// Cut a slab of `fraction` off the leading edge of the long axis.
fn split_slab(bounds: Rect, fraction: f64) -> (Rect, Rect) {
    if bounds.is_wide() {
        let w = bounds.width * fraction;
        (
            Rect::new(bounds.x, bounds.y, w, bounds.height),
            Rect::new(bounds.x + w, bounds.y, bounds.width - w, bounds.height),
        )
    } else {
        let h = bounds.height * fraction;
        (
            Rect::new(bounds.x, bounds.y, bounds.width, h),
            Rect::new(bounds.x, bounds.y + h, bounds.width, bounds.height - h),
        )
    }
}

/// Stack a committed row along the slab's short side.
fn place_row<T>(
    row: Vec<(f64, T)>,
    row_total: f64,
    slab: Rect,
    wide: bool,
    out: &mut Vec<Placed<T>>,
) {
    let mut offset = 0.0;
    for (w, item) in row {
        let fraction = w / row_total;
        let rect = if wide {
            let h = slab.height * fraction;
            let r = Rect::new(slab.x, slab.y + offset, slab.width, h);
            offset += h;
            r
        } else {
            let w = slab.width * fraction;
            let r = Rect::new(slab.x + offset, slab.y, w, slab.height);
            offset += w;
            r
        };
        out.push(Placed { item, rect });
    }
}

fn sanitize(w: f64) -> f64 {
    if w.is_finite() && w > 0.0 {
        w
    } else {
        0.0
    }
}
