use crate::model::{GlobalEffect, PixelStrip, Rgb, BLACK};

/// Half-width of the global scanner beam in layout units.
const BEAM_WIDTH: f32 = 0.15;
/// Distance between lit pixels in the chase pattern.
const CHASE_GAP: i64 = 5;

const RED: Rgb = [255.0, 0.0, 0.0];
const GREEN: Rgb = [0.0, 255.0, 0.0];

/// Renders the named effect into every strip.
///
/// Unrecognized names leave the buffers untouched and return `false`.
pub fn render_named(name: &str, strips: &mut [PixelStrip], t: f32, speed: f32) -> bool {
    match GlobalEffect::from_name(name) {
        Some(effect) => {
            render(effect, strips, t, speed);
            true
        }
        None => false,
    }
}

pub fn render(effect: GlobalEffect, strips: &mut [PixelStrip], t: f32, speed: f32) {
    match effect {
        GlobalEffect::Scanner => scanner(strips, t, speed),
        GlobalEffect::Chase => chase(strips, t, speed),
        GlobalEffect::Rainbow => rainbow(strips, t),
    }
}

/// A red beam sweeping across layout x in [0, 1]. Each strip is lit
/// uniformly by its distance from the beam.
pub fn scanner(strips: &mut [PixelStrip], t: f32, speed: f32) {
    let pos = ((2.0 * t * speed).sin() + 1.0) / 2.0;
    for strip in strips.iter_mut() {
        let brightness = (1.0 - (strip.x - pos).abs() / BEAM_WIDTH).max(0.0);
        let color = [RED[0] * brightness, 0.0, 0.0];
        strip.data = vec![color; strip.pixel_count];
    }
}

/// Green dot every fifth pixel, marching with time.
pub fn chase(strips: &mut [PixelStrip], t: f32, speed: f32) {
    let offset = (t * 10.0 * speed).floor() as i64;
    for strip in strips.iter_mut() {
        strip.data = (0..strip.pixel_count)
            .map(|i| {
                if (i as i64 + offset).rem_euclid(CHASE_GAP) == 0 {
                    GREEN
                } else {
                    BLACK
                }
            })
            .collect();
    }
}

/// Hue wheel spread across each strip, rotating at a fixed rate.
pub fn rainbow(strips: &mut [PixelStrip], t: f32) {
    let base = ((t * 50.0).floor() as i64).rem_euclid(255) as usize;
    for strip in strips.iter_mut() {
        let n = strip.pixel_count;
        strip.data = (0..n)
            .map(|i| {
                let hue = (base + i * 256 / n) & 255;
                let [r, g, b] = wheel(hue as u8);
                [r as f32, g as f32, b as f32]
            })
            .collect();
    }
}

/// 0..=255 color wheel: red to green to blue and back to red.
pub fn wheel(pos: u8) -> [u8; 3] {
    match pos {
        0..=84 => [pos * 3, 255 - pos * 3, 0],
        85..=169 => {
            let p = pos - 85;
            [255 - p * 3, 0, p * 3]
        }
        _ => {
            let p = pos - 170;
            [0, p * 3, 255 - p * 3]
        }
    }
}
