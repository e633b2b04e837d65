//! Serializes strip colors into fixed 512-channel universes.

use std::collections::BTreeMap;

use crate::model::{PixelStrip, Rgb, CHANNELS_PER_PIXEL, UNIVERSE_SIZE};

pub type UniverseBuffer = [u8; UNIVERSE_SIZE];

/// One packed frame: every universe to transmit, keyed by universe id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Frame {
    universes: BTreeMap<u16, UniverseBuffer>,
}

impl Frame {
    /// A frame holding a zeroed buffer for each of `universes`.
    pub fn with_universes(universes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            universes: universes
                .into_iter()
                .map(|u| (u, [0u8; UNIVERSE_SIZE]))
                .collect(),
        }
    }

    pub fn get(&self, universe: u16) -> Option<&UniverseBuffer> {
        self.universes.get(&universe)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &UniverseBuffer)> {
        self.universes.iter().map(|(u, data)| (*u, data))
    }

    pub fn universe_ids(&self) -> Vec<u16> {
        self.universes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.universes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.universes.is_empty()
    }

    /// Writes `bytes` starting at `offset` (0-based) in `universe`, carrying
    /// on at offset 0 of the following universes when a universe fills up.
    /// Returns the number of bytes written.
    pub fn write(&mut self, universe: u16, offset: usize, bytes: &[u8]) -> usize {
        let mut current = Some(universe);
        let mut index = offset;
        let mut written = 0;

        while written < bytes.len() {
            let Some(u) = current else {
                break; // ran past the last universe id
            };
            if index >= UNIVERSE_SIZE {
                current = u.checked_add(1);
                index = 0;
                continue;
            }

            let chunk = (UNIVERSE_SIZE - index).min(bytes.len() - written);
            let buffer = self.universes.entry(u).or_insert([0u8; UNIVERSE_SIZE]);
            buffer[index..index + chunk].copy_from_slice(&bytes[written..written + chunk]);

            written += chunk;
            current = u.checked_add(1);
            index = 0;
        }
        written
    }
}

/// Flattened output of one strip, detached from the engine state.
#[derive(Clone, Debug, PartialEq)]
pub struct StripPayload {
    pub universe: u16,
    pub start_channel: u16,
    pub bytes: Vec<u8>,
}

impl StripPayload {
    pub fn from_strip(strip: &PixelStrip) -> Self {
        Self {
            universe: strip.universe,
            start_channel: strip.start_channel,
            bytes: flatten(&strip.data),
        }
    }
}

/// Clamps a working channel value to a DMX byte, truncating the fraction.
pub fn channel_byte(value: f32) -> u8 {
    // float-to-int `as` saturates and maps NaN to 0
    value.clamp(0.0, 255.0) as u8
}

/// `R,G,B,R,G,B,...` bytes for a color buffer.
pub fn flatten(colors: &[Rgb]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(colors.len() * CHANNELS_PER_PIXEL);
    for px in colors {
        bytes.extend(px.iter().map(|&c| channel_byte(c)));
    }
    bytes
}

/// Packs every payload into a frame that also carries a zeroed buffer for
/// each already-active universe.
pub fn pack(payloads: &[StripPayload], active: impl IntoIterator<Item = u16>) -> Frame {
    let mut frame = Frame::with_universes(active);
    for payload in payloads {
        let offset = (payload.start_channel as usize).saturating_sub(1);
        let written = frame.write(payload.universe, offset, &payload.bytes);
        if written < payload.bytes.len() {
            log::warn!(
                "[PACK] Strip at universe {} truncated: {} of {} bytes fit",
                payload.universe,
                written,
                payload.bytes.len()
            );
        }
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE_ACTIVE: [u16; 0] = [];

    fn payload(universe: u16, start_channel: u16, bytes: Vec<u8>) -> StripPayload {
        StripPayload {
            universe,
            start_channel,
            bytes,
        }
    }

    #[test]
    fn strip_crossing_boundary_continues_in_next_universe() {
        // channels 511 and 512 hold the first two bytes
        let frame = pack(&[payload(1, 511, vec![1, 2, 3, 4, 5, 6])], NONE_ACTIVE);
        assert_eq!(&frame.get(1).unwrap()[509..], &[0, 1, 2]);
        assert_eq!(&frame.get(2).unwrap()[..5], &[3, 4, 5, 6, 0]);
        assert_eq!(frame.len(), 2);

        // only the last channel is free: one byte, then five in the next universe
        let frame = pack(&[payload(1, 512, vec![1, 2, 3, 4, 5, 6])], NONE_ACTIVE);
        assert_eq!(frame.get(1).unwrap()[511], 1);
        assert_eq!(&frame.get(2).unwrap()[..6], &[2, 3, 4, 5, 6, 0]);
    }

    #[test]
    fn long_strip_spans_three_universes() {
        // 400 pixels = 1200 bytes
        let bytes: Vec<u8> = (0..1200).map(|i| (i % 251) as u8).collect();
        let frame = pack(&[payload(10, 1, bytes.clone())], NONE_ACTIVE);

        assert_eq!(frame.universe_ids(), vec![10, 11, 12]);
        assert_eq!(&frame.get(10).unwrap()[..], &bytes[..512]);
        assert_eq!(&frame.get(11).unwrap()[..], &bytes[512..1024]);
        assert_eq!(&frame.get(12).unwrap()[..176], &bytes[1024..]);
        assert!(frame.get(12).unwrap()[176..].iter().all(|&b| b == 0));
    }

    #[test]
    fn active_universes_always_present() {
        let frame = pack(&[payload(1, 4, vec![9, 9, 9])], [1, 7]);
        assert_eq!(frame.universe_ids(), vec![1, 7]);
        assert!(frame.get(7).unwrap().iter().all(|&b| b == 0));
        assert_eq!(&frame.get(1).unwrap()[..7], &[0, 0, 0, 9, 9, 9, 0]);
    }

    #[test]
    fn channels_clamp_and_truncate() {
        let bytes = flatten(&[[-4.0, 127.9, 300.0], [0.0, 255.0, f32::NAN]]);
        assert_eq!(bytes, vec![0, 127, 255, 0, 255, 0]);
    }

    #[test]
    fn whole_valued_channels_pack_losslessly() {
        let colors: Vec<Rgb> = (0..=255)
            .map(|v| [v as f32, (255 - v) as f32, (v / 2) as f32])
            .collect();
        let bytes = flatten(&colors);
        for (i, px) in colors.iter().enumerate() {
            for c in 0..3 {
                assert_eq!(bytes[i * 3 + c], px[c].round().clamp(0.0, 255.0) as u8);
            }
        }
    }

    #[test]
    fn last_universe_id_does_not_wrap() {
        let frame = pack(&[payload(u16::MAX, 511, vec![1; 6])], NONE_ACTIVE);
        assert_eq!(frame.universe_ids(), vec![u16::MAX]);
        assert_eq!(&frame.get(u16::MAX).unwrap()[510..], &[1, 1]);
    }
}
