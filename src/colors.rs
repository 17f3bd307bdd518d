use indexmap::IndexMap;

use crate::models::{DomainColorInfo, DomainColors, DomainNode};

/// Used when neither the domain nor any ancestor has a color.
pub const DEFAULT_TILE_COLOR: &str = "#64748b";

const FALLBACK_SATURATION: f64 = 0.55;
const FALLBACK_LIGHTNESS: f64 = 0.45;

// ---------------------------------------------------------------------------
// Deterministic fallback
// ---------------------------------------------------------------------------

/// Hue in `0..360` derived from the UTF-16 code units of `s`.
///
/// Only the shift works on the 32-bit truncation of the running hash; the
/// add and subtract do not wrap.
pub fn hash_hue(s: &str) -> u32 {
    let mut hash: i64 = 0;
    for unit in s.encode_utf16() {
        let shifted = i64::from((hash as i32).wrapping_shl(5));
        hash = i64::from(unit) + (shifted - hash);
    }
    (hash.unsigned_abs() % 360) as u32
}

/// `hsl(h, 55%, 45%)` rendered as `#rrggbb`. Never fails.
pub fn fallback_color(domain: &str) -> String {
    hsl_to_hex(
        f64::from(hash_hue(domain)),
        FALLBACK_SATURATION,
        FALLBACK_LIGHTNESS,
    )
}

/// `h` in degrees, `s` and `l` in `0..=1`.
pub fn hsl_to_hex(h: f64, s: f64, l: f64) -> String {
    let a = s * l.min(1.0 - l);
    let channel = |n: f64| {
        let k = (n + h / 30.0) % 12.0;
        let v = l - a * (k - 3.0).min(9.0 - k).clamp(-1.0, 1.0);
        (v * 255.0).round().clamp(0.0, 255.0) as u8
    };
    rgb_to_hex(channel(0.0), channel(8.0), channel(4.0))
}

pub fn rgb_to_hex(r: u8, g: u8, b: u8) -> String {
    format!("#{r:02x}{g:02x}{b:02x}")
}

fn parse_hex(hex: &str) -> Option<(u8, u8, u8)> {
    let hex = hex.strip_prefix('#')?;
    if hex.len() != 6 {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    Some((channel(0)?, channel(2)?, channel(4)?))
}

/// Insert a fallback entry for every domain that has none yet.
///
/// Existing entries (including favicon-derived ones) are left alone.
pub fn seed_fallback_colors(hierarchy: &[DomainNode], colors: &mut DomainColors) {
    for domain in hierarchy {
        colors
            .entry(domain.id.clone())
            .or_insert_with(|| DomainColorInfo {
                color: fallback_color(&domain.id),
                favicon_url: None,
            });
    }
}

// ---------------------------------------------------------------------------
// Contrast helpers
// ---------------------------------------------------------------------------

/// WCAG relative luminance of an sRGB color.
pub fn luminance(r: u8, g: u8, b: u8) -> f64 {
    let lin = |c: u8| {
        let c = f64::from(c) / 255.0;
        if c <= 0.03928 {
            c / 12.92
        } else {
            ((c + 0.055) / 1.055).powf(2.4)
        }
    };
    0.2126 * lin(r) + 0.7152 * lin(g) + 0.0722 * lin(b)
}

/// Black or white, whichever reads better on `hex`.
pub fn contrast_text_color(hex: &str) -> &'static str {
    match parse_hex(hex) {
        Some((r, g, b)) if luminance(r, g, b) > 0.179 => "#000000",
        _ => "#ffffff",
    }
}

/// Scale every channel down by `amount` (`0..=1`).
pub fn darken_color(hex: &str, amount: f64) -> String {
    let Some((r, g, b)) = parse_hex(hex) else {
        return hex.to_string();
    };
    let scale = |c: u8| (f64::from(c) * (1.0 - amount)).round().clamp(0.0, 255.0) as u8;
    rgb_to_hex(scale(r), scale(g), scale(b))
}

// ---------------------------------------------------------------------------
// Dominant color sampling
// ---------------------------------------------------------------------------

/// Most frequent quantized color among RGBA pixels, skipping transparent,
/// near-white and near-black ones. `None` when nothing usable remains.
pub fn dominant_color(rgba: &[u8]) -> Option<String> {
    let mut freq: IndexMap<(u8, u8, u8), u32> = IndexMap::new();

    for px in rgba.chunks_exact(4) {
        let (r, g, b, a) = (px[0], px[1], px[2], px[3]);
        if a < 128 {
            continue;
        }
        if r > 240 && g > 240 && b > 240 {
            continue;
        }
        if r < 15 && g < 15 && b < 15 {
            continue;
        }
        *freq.entry((quantize(r), quantize(g), quantize(b))).or_insert(0) += 1;
    }

    let mut best: Option<((u8, u8, u8), u32)> = None;
    for (color, count) in freq {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((color, count));
        }
    }
    best.map(|((r, g, b), _)| rgb_to_hex(r, g, b))
}

fn quantize(c: u8) -> u8 {
    ((f64::from(c) / 16.0).round() * 16.0).min(255.0) as u8
}
