//! Pixel-mapped LED strip rendering over sACN.
//!
//! Strips are placed on a normalized 2D canvas. Each tick either composites
//! spatial masks onto the pixels under them or runs a whole-layout effect,
//! then packs the colors into 512-channel universes and multicasts them.

pub mod compositor;
pub mod config;
pub mod effects;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod link;
pub mod model;
pub mod packer;
pub mod store;
pub mod transmitter;

pub use config::EngineConfig;
pub use engine::{EngineStatus, LightingEngine, LoopState};
pub use error::{EngineError, EngineResult};
pub use model::{
    LayoutUpdate, Mask, MaskKind, MaskShape, MaskUpdate, Mode, NewMask, NewStrip,
    PersistedDocument, PixelStrip, StripUpdate,
};
