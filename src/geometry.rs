//! Per-strip pixel coordinates.
//!
//! A strip is a straight line of `pixel_count` pixels centred on `(x, y)`.
//! In strip-local space the pixels sit on the x axis, evenly spaced from
//! `-L/2` to `+L/2` where `L = (pixel_count - 1) * spacing`. Each local point
//! is rotated by `rotation` radians about the origin
//!
//! ```text
//! x' = x·cos(θ) - y·sin(θ)
//! y' = x·sin(θ) + y·cos(θ)
//! ```
//!
//! and then translated by the strip position. The compositor indexes pixels by
//! these coordinates, so an entry must be rebuilt whenever count, spacing,
//! rotation or position changes.

use glam::Vec2;
use std::collections::HashMap;

use crate::model::PixelStrip;

/// Computes the world-space position of every pixel, indexed like the strip's
/// color buffer.
pub fn pixel_coords(strip: &PixelStrip) -> Vec<Vec2> {
    let n = strip.pixel_count;
    if n == 0 {
        return Vec::new();
    }

    let half_len = (n - 1) as f32 * strip.spacing / 2.0;
    let (sin_t, cos_t) = strip.rotation.sin_cos();
    let origin = Vec2::new(strip.x, strip.y);

    (0..n)
        .map(|i| {
            let local_x = i as f32 * strip.spacing - half_len;
            // local y is always zero, so the rotation collapses to a scale
            origin + Vec2::new(local_x * cos_t, local_x * sin_t)
        })
        .collect()
}

#[derive(Default, Debug)]
pub struct GeometryCache {
    coords: HashMap<u64, Vec<Vec2>>,
}

impl GeometryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recompute(&mut self, strip: &PixelStrip) -> &[Vec2] {
        let coords = self.coords.entry(strip.id).or_default();
        *coords = pixel_coords(strip);
        coords
    }

    /// Cached coordinates for `strip`, rebuilt if missing or the wrong length.
    pub fn coords_for(&mut self, strip: &PixelStrip) -> &[Vec2] {
        let stale = self
            .coords
            .get(&strip.id)
            .map_or(true, |c| c.len() != strip.pixel_count);
        if stale {
            return self.recompute(strip);
        }
        &self.coords[&strip.id]
    }

    pub fn get(&self, id: u64) -> Option<&[Vec2]> {
        self.coords.get(&id).map(Vec::as_slice)
    }

    pub fn remove(&mut self, id: u64) {
        self.coords.remove(&id);
    }

    pub fn clear(&mut self) {
        self.coords.clear();
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }
}
