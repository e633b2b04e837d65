use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::EngineError;

/// Channels in one DMX universe.
pub const UNIVERSE_SIZE: usize = 512;
pub const CHANNELS_PER_PIXEL: usize = 3;

/// Working color of a pixel. Kept in floating point until packing.
pub type Rgb = [f32; 3];
pub const BLACK: Rgb = [0.0, 0.0, 0.0];

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PixelStrip {
    pub id: u64,
    pub universe: u16,
    pub pixel_count: usize,
    pub start_channel: u16,
    #[serde(default = "default_position")]
    pub x: f32, // Normalized 0..1
    #[serde(default = "default_position")]
    pub y: f32, // Normalized 0..1
    #[serde(default = "default_spacing")]
    pub spacing: f32,
    #[serde(default)]
    pub rotation: f32, // Radians
    #[serde(skip)]
    pub data: Vec<Rgb>,
}

fn default_position() -> f32 {
    0.5
}

fn default_spacing() -> f32 {
    0.01
}

impl PixelStrip {
    pub fn new(id: u64, fields: &NewStrip) -> Self {
        let mut strip = Self {
            id,
            universe: fields.universe,
            pixel_count: fields.pixel_count,
            start_channel: fields.start_channel,
            x: fields.x,
            y: fields.y,
            spacing: fields.spacing,
            rotation: fields.rotation,
            data: Vec::new(),
        };
        strip.resize_buffer();
        strip
    }

    /// Brings the color buffer back in line with `pixel_count`, blacking it out.
    pub fn resize_buffer(&mut self) {
        self.data = vec![BLACK; self.pixel_count];
    }

    pub fn clear(&mut self) {
        self.data.iter_mut().for_each(|px| *px = BLACK);
    }

    /// 0-based channel offset of the first byte inside `universe`.
    pub fn start_offset(&self) -> usize {
        (self.start_channel as usize).saturating_sub(1)
    }

    pub fn byte_len(&self) -> usize {
        self.pixel_count * CHANNELS_PER_PIXEL
    }

    /// Every universe touched by this strip's byte span, in order.
    pub fn required_universes(&self) -> Vec<u16> {
        if self.pixel_count == 0 {
            return Vec::new();
        }
        let last_byte = self.start_offset() + self.byte_len() - 1;
        let extra = (last_byte / UNIVERSE_SIZE).min(u16::MAX as usize) as u16;
        (0..=extra)
            .map_while(|i| self.universe.checked_add(i))
            .collect()
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.universe == 0 {
            return Err(EngineError::InvalidStrip("universe must be at least 1".into()));
        }
        if self.start_channel == 0 || self.start_channel as usize > UNIVERSE_SIZE {
            return Err(EngineError::InvalidStrip(format!(
                "start channel {} outside 1..=512",
                self.start_channel
            )));
        }
        if ![self.x, self.y, self.spacing, self.rotation]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(EngineError::InvalidStrip("placement must be finite".into()));
        }
        Ok(())
    }
}

/// Fields for a strip that does not exist yet.
#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct NewStrip {
    pub universe: u16,
    pub start_channel: u16,
    pub pixel_count: usize,
    pub x: f32,
    pub y: f32,
    pub spacing: f32,
    pub rotation: f32,
}

impl Default for NewStrip {
    fn default() -> Self {
        Self {
            universe: 1,
            start_channel: 1,
            pixel_count: 50,
            x: default_position(),
            y: default_position(),
            spacing: default_spacing(),
            rotation: 0.0,
        }
    }
}

/// Partial strip update; `None` leaves a field alone.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct StripUpdate {
    pub universe: Option<u16>,
    pub start_channel: Option<u16>,
    pub pixel_count: Option<usize>,
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub spacing: Option<f32>,
    pub rotation: Option<f32>,
}

impl StripUpdate {
    pub fn position(x: f32, y: f32) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Default::default()
        }
    }

    pub fn touches_geometry(&self) -> bool {
        self.pixel_count.is_some()
            || self.x.is_some()
            || self.y.is_some()
            || self.spacing.is_some()
            || self.rotation.is_some()
    }
}

/// One entry of a bulk layout update.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct LayoutUpdate {
    pub id: u64,
    pub x: f32,
    pub y: f32,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MaskKind {
    Scanner,
    Radial,
}

impl MaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MaskKind::Scanner => "scanner",
            MaskKind::Radial => "radial",
        }
    }
}

impl FromStr for MaskKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scanner" => Ok(MaskKind::Scanner),
            "radial" => Ok(MaskKind::Radial),
            other => Err(EngineError::UnknownMaskType(other.to_string())),
        }
    }
}

impl fmt::Display for MaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Oscillating bar clipped to a `width × height` travel box.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ScannerParams {
    pub width: f32,
    pub height: f32,
    pub speed: f32,
    pub thickness: f32,
    pub color: [u8; 3],
}

impl Default for ScannerParams {
    fn default() -> Self {
        Self {
            width: 0.3,
            height: 0.3,
            speed: 1.0,
            thickness: 0.05,
            color: [0, 255, 255],
        }
    }
}

/// Circular region with linear falloff to its edge.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RadialParams {
    pub radius: f32,
    pub color: [u8; 3],
}

impl Default for RadialParams {
    fn default() -> Self {
        Self {
            radius: 0.2,
            color: [255, 0, 255],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MaskShape {
    Scanner(ScannerParams),
    Radial(RadialParams),
}

impl MaskShape {
    pub fn defaults(kind: MaskKind) -> Self {
        match kind {
            MaskKind::Scanner => MaskShape::Scanner(ScannerParams::default()),
            MaskKind::Radial => MaskShape::Radial(RadialParams::default()),
        }
    }

    pub fn kind(&self) -> MaskKind {
        match self {
            MaskShape::Scanner(_) => MaskKind::Scanner,
            MaskShape::Radial(_) => MaskKind::Radial,
        }
    }

    /// Builds typed parameters from a loose map. Missing keys take the
    /// type's defaults, unknown keys are dropped.
    pub fn from_params(kind: MaskKind, params: &Map<String, Value>) -> Result<Self, EngineError> {
        let value = Value::Object(params.clone());
        let invalid = |e: serde_json::Error| EngineError::InvalidParams(format!("{}: {}", kind, e));
        Ok(match kind {
            MaskKind::Scanner => MaskShape::Scanner(serde_json::from_value(value).map_err(invalid)?),
            MaskKind::Radial => MaskShape::Radial(serde_json::from_value(value).map_err(invalid)?),
        })
    }

    pub fn params(&self) -> Map<String, Value> {
        let value = match self {
            MaskShape::Scanner(p) => serde_json::to_value(p),
            MaskShape::Radial(p) => serde_json::to_value(p),
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }

    /// Overlays `patch` on the current parameters.
    pub fn merged(&self, patch: &Map<String, Value>) -> Result<Self, EngineError> {
        let mut params = self.params();
        params.extend(patch.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self::from_params(self.kind(), &params)
    }

    pub fn color(&self) -> [u8; 3] {
        match self {
            MaskShape::Scanner(p) => p.color,
            MaskShape::Radial(p) => p.color,
        }
    }
}

/// A spatial light shape composited onto the layout.
///
/// On the wire and on disk a mask is `{id, type, x, y, params}`; in memory the
/// params are typed per shape.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(try_from = "MaskRecord", into = "MaskRecord")]
pub struct Mask {
    pub id: u64,
    pub x: f32,
    pub y: f32,
    pub shape: MaskShape,
}

impl Mask {
    pub fn kind(&self) -> MaskKind {
        self.shape.kind()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct MaskRecord {
    id: u64,
    #[serde(rename = "type")]
    mask_type: String,
    #[serde(default = "default_position")]
    x: f32,
    #[serde(default = "default_position")]
    y: f32,
    #[serde(default)]
    params: Map<String, Value>,
}

impl TryFrom<MaskRecord> for Mask {
    type Error = EngineError;

    fn try_from(record: MaskRecord) -> Result<Self, Self::Error> {
        let kind: MaskKind = record.mask_type.parse()?;
        Ok(Mask {
            id: record.id,
            x: record.x,
            y: record.y,
            shape: MaskShape::from_params(kind, &record.params)?,
        })
    }
}

impl From<Mask> for MaskRecord {
    fn from(mask: Mask) -> Self {
        MaskRecord {
            id: mask.id,
            mask_type: mask.kind().as_str().to_string(),
            x: mask.x,
            y: mask.y,
            params: mask.shape.params(),
        }
    }
}

/// Fields for a mask that does not exist yet.
#[derive(Deserialize, Clone, Debug)]
pub struct NewMask {
    #[serde(rename = "type")]
    pub mask_type: MaskKind,
    #[serde(default = "default_position")]
    pub x: f32,
    #[serde(default = "default_position")]
    pub y: f32,
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl NewMask {
    pub fn new(mask_type: MaskKind) -> Self {
        Self {
            mask_type,
            x: default_position(),
            y: default_position(),
            params: Map::new(),
        }
    }

    pub fn at(mut self, x: f32, y: f32) -> Self {
        self.x = x;
        self.y = y;
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// Partial mask update. A `mask_type` different from the current one
/// rebuilds the parameters from that type's defaults.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct MaskUpdate {
    #[serde(rename = "type")]
    pub mask_type: Option<MaskKind>,
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub params: Option<Map<String, Value>>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Global,
    #[default]
    Spatial,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Global => "global",
            Mode::Spatial => "spatial",
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "global" => Ok(Mode::Global),
            "spatial" => Ok(Mode::Spatial),
            other => Err(format!("unknown mode '{}'", other)),
        }
    }
}

/// Whole-layout patterns used in global mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlobalEffect {
    Scanner,
    Chase,
    Rainbow,
}

impl GlobalEffect {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "scanner" => Some(GlobalEffect::Scanner),
            "chase" => Some(GlobalEffect::Chase),
            "rainbow" => Some(GlobalEffect::Rainbow),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            GlobalEffect::Scanner => "scanner",
            GlobalEffect::Chase => "chase",
            GlobalEffect::Rainbow => "rainbow",
        }
    }
}

pub fn default_effect() -> String {
    GlobalEffect::Scanner.name().to_string()
}

/// Snapshot written to disk after every mutation.
///
/// Strip and mask records are read one at a time; a record that does not
/// parse is logged and dropped without losing its neighbours.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PersistedDocument {
    #[serde(default, deserialize_with = "skip_bad_records")]
    pub strips: Vec<PixelStrip>,
    #[serde(default, deserialize_with = "skip_bad_records")]
    pub masks: Vec<Mask>,
    #[serde(default)]
    pub bind_address: Option<String>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_effect")]
    pub effect: String,
}

fn skip_bad_records<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let records = Vec::<Value>::deserialize(deserializer)?;
    Ok(records
        .into_iter()
        .filter_map(|record| match serde_json::from_value(record) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("[STORE] Skipping {}", EngineError::MalformedRecord(e.to_string()));
                None
            }
        })
        .collect())
}

impl Default for PersistedDocument {
    fn default() -> Self {
        Self {
            strips: Vec::new(),
            masks: Vec::new(),
            bind_address: None,
            mode: Mode::default(),
            effect: default_effect(),
        }
    }
}
