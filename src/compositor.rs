//! Spatial mask compositing.
//!
//! Every frame the strips are cleared to black and each mask is blended on top
//! in list order. A mask is tested against a strip's cached coordinate array in
//! one pass; every hit pixel receives `color * intensity` added per channel and
//! saturated at 255.
//!
//! # Scanner
//!
//! The bar centre oscillates around the mask position:
//!
//! ```text
//! bar_x = x + (width / 2) · sin(t · speed)
//! ```
//!
//! A pixel is hit when it lies within `height / 2` of the mask's `y`, within
//! `thickness` of `bar_x`, and within `width / 2` of the mask's own `x`. The
//! last test clips against the static travel box, not the moving bar, so the
//! bar truncates at the box edges. Intensity falls off linearly from the bar
//! centre: `1 - |px - bar_x| / thickness`.
//!
//! # Radial
//!
//! A pixel strictly inside `radius` of the mask centre is hit with intensity
//! `1 - distance / radius`.

use glam::Vec2;

use crate::geometry::GeometryCache;
use crate::model::{Mask, MaskShape, PixelStrip, RadialParams, Rgb, ScannerParams};

/// Clears every strip and blends all masks for time `t` (seconds).
pub fn composite(masks: &[Mask], strips: &mut [PixelStrip], cache: &mut GeometryCache, t: f32) {
    for strip in strips.iter_mut() {
        if strip.data.len() == strip.pixel_count {
            strip.clear();
        } else {
            strip.resize_buffer();
        }
    }

    for mask in masks {
        apply_mask(mask, strips, cache, t);
    }
}

pub fn apply_mask(mask: &Mask, strips: &mut [PixelStrip], cache: &mut GeometryCache, t: f32) {
    let center = Vec2::new(mask.x, mask.y);
    match &mask.shape {
        MaskShape::Scanner(params) => apply_scanner(center, params, strips, cache, t),
        MaskShape::Radial(params) => apply_radial(center, params, strips, cache),
    }
}

/// Horizontal centre of the scanner bar at time `t`.
pub fn scanner_bar_x(center_x: f32, params: &ScannerParams, t: f32) -> f32 {
    center_x + (params.width / 2.0) * (t * params.speed).sin()
}

fn apply_scanner(
    center: Vec2,
    params: &ScannerParams,
    strips: &mut [PixelStrip],
    cache: &mut GeometryCache,
    t: f32,
) {
    if params.thickness <= 0.0 {
        return;
    }

    let bar_x = scanner_bar_x(center.x, params, t);
    let half_w = params.width / 2.0;
    let half_h = params.height / 2.0;

    for strip in strips.iter_mut() {
        let coords = cache.coords_for(strip);
        blend_hits(&mut strip.data, coords, params.color, |p| {
            let in_y = (p.y - center.y).abs() <= half_h;
            let dist = (p.x - bar_x).abs();
            let in_bar = dist <= params.thickness;
            let in_clip = (p.x - center.x).abs() <= half_w;
            (in_y && in_bar && in_clip).then(|| 1.0 - dist / params.thickness)
        });
    }
}

fn apply_radial(
    center: Vec2,
    params: &RadialParams,
    strips: &mut [PixelStrip],
    cache: &mut GeometryCache,
) {
    if params.radius <= 0.0 {
        return;
    }

    for strip in strips.iter_mut() {
        let coords = cache.coords_for(strip);
        blend_hits(&mut strip.data, coords, params.color, |p| {
            let dist = p.distance(center);
            (dist < params.radius).then(|| 1.0 - dist / params.radius)
        });
    }
}

/// Runs `hit` over every coordinate and adds the mask color to the pixels it
/// returns an intensity for.
fn blend_hits<F>(data: &mut [Rgb], coords: &[Vec2], color: [u8; 3], hit: F)
where
    F: Fn(Vec2) -> Option<f32>,
{
    for (pixel, &pos) in data.iter_mut().zip(coords) {
        if let Some(intensity) = hit(pos) {
            add_saturating(pixel, color, intensity);
        }
    }
}

pub fn add_saturating(pixel: &mut Rgb, color: [u8; 3], intensity: f32) {
    for (channel, &c) in pixel.iter_mut().zip(color.iter()) {
        *channel = (*channel + c as f32 * intensity).min(255.0);
    }
}
