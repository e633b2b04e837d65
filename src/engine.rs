use glam::Vec2;
use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Map;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::compositor;
use crate::config::{self, EngineConfig};
use crate::effects;
use crate::error::{EngineError, EngineResult};
use crate::geometry::GeometryCache;
use crate::link::{TempoHandle, TempoSnapshot};
use crate::model::{
    GlobalEffect, LayoutUpdate, Mask, MaskShape, MaskUpdate, Mode, NewMask, NewStrip,
    PersistedDocument, PixelStrip, StripUpdate,
};
use crate::packer::{self, Frame, StripPayload};
use crate::store::{ConfigStore, PersistWriter};
use crate::transmitter::{self, MemoryFactory, SacnFactory, SenderFactory, Transmitter};

/// Everything the control surface mutates. Guarded by one lock; the render
/// tick holds it only while computing colors.
pub struct EngineState {
    pub strips: Vec<PixelStrip>,
    pub masks: Vec<Mask>,
    pub mode: Mode,
    pub effect: String,
    pub speed: f32,
    pub bind_address: Option<String>,
    geometry: GeometryCache,
}

impl EngineState {
    fn new(speed: f32) -> Self {
        Self {
            strips: Vec::new(),
            masks: Vec::new(),
            mode: Mode::default(),
            effect: crate::model::default_effect(),
            speed,
            bind_address: None,
            geometry: GeometryCache::new(),
        }
    }

    fn document(&self) -> PersistedDocument {
        PersistedDocument {
            strips: self.strips.clone(),
            masks: self.masks.clone(),
            bind_address: self.bind_address.clone(),
            mode: self.mode,
            effect: self.effect.clone(),
        }
    }

    fn required_universes(&self) -> Vec<u16> {
        let set: BTreeSet<u16> = self
            .strips
            .iter()
            .flat_map(PixelStrip::required_universes)
            .collect();
        set.into_iter().collect()
    }

    fn next_strip_id(&self) -> u64 {
        self.strips.iter().map(|s| s.id).max().unwrap_or(0) + 1
    }

    fn next_mask_id(&self) -> u64 {
        self.masks.iter().map(|m| m.id).max().unwrap_or(0) + 1
    }

    fn strip_mut(&mut self, id: u64) -> EngineResult<&mut PixelStrip> {
        self.strips
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(EngineError::StripNotFound(id))
    }

    /// Computes this tick's colors and detaches them for packing.
    fn render(&mut self, t: f32) -> Vec<StripPayload> {
        match self.mode {
            Mode::Spatial => {
                compositor::composite(&self.masks, &mut self.strips, &mut self.geometry, t)
            }
            Mode::Global => {
                // unknown names keep whatever the buffers already hold
                effects::render_named(&self.effect, &mut self.strips, t, self.speed);
            }
        }
        self.strips.iter().map(StripPayload::from_strip).collect()
    }

    /// Replaces strips and masks with a restored document.
    fn restore(&mut self, doc: PersistedDocument) {
        self.mode = doc.mode;
        self.effect = doc.effect;
        self.bind_address = doc.bind_address;
        self.geometry.clear();
        self.strips.clear();

        for mut strip in doc.strips {
            if let Err(e) = strip.validate() {
                let e = EngineError::MalformedRecord(format!("strip {}: {}", strip.id, e));
                warn!("[ENGINE] Skipping {}", e);
                continue;
            }
            strip.resize_buffer();
            self.geometry.recompute(&strip);
            self.strips.push(strip);
        }
        self.masks = doc.masks;
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Idle,
    Running,
}

#[derive(Serialize, Clone, Debug)]
pub struct EngineStatus {
    pub current_ip: Option<String>,
    pub mode: Mode,
    pub effect: String,
    pub speed: f32,
    pub state: LoopState,
    pub fps: u32,
    pub active_universes: Vec<u16>,
    pub strips: usize,
    pub masks: usize,
}

struct Shared {
    state: Mutex<EngineState>,
    transmitter: Mutex<Transmitter>,
    writer: Mutex<Option<PersistWriter>>,
    tempo: Mutex<TempoHandle>,
    running: AtomicBool,
    fps: u32,
    started: Instant,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, EngineState> {
        transmitter::lock(&self.state)
    }

    fn transmitter(&self) -> MutexGuard<'_, Transmitter> {
        transmitter::lock(&self.transmitter)
    }

    fn elapsed(&self) -> f32 {
        animation_time(self.started.elapsed())
    }

    fn persist(&self, doc: PersistedDocument) {
        if let Some(writer) = transmitter::lock(&self.writer).as_ref() {
            writer.submit(doc);
        }
    }

    fn tick_at(&self, t: f32) -> Frame {
        let payloads = self.state().render(t);

        let (frame, dispatch) = {
            let mut tx = self.transmitter();
            let frame = packer::pack(&payloads, tx.active_universes());
            let dispatch = tx.prepare(&frame);
            (frame, dispatch)
        };
        // sends run without the transmitter lock so control calls never wait
        // on the network
        if let Some(dispatch) = dispatch {
            dispatch.send(&frame);
        }
        frame
    }
}

/// The render-and-transmit engine.
///
/// All control methods take `&self`; share the engine behind an `Arc` with
/// whatever serves the control API.
pub struct LightingEngine {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LightingEngine {
    pub fn new(config: &EngineConfig, factory: Box<dyn SenderFactory>) -> Self {
        info!("[ENGINE] Initializing at {} fps", config.fps);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(EngineState::new(config::clamp_speed(config.speed))),
                transmitter: Mutex::new(Transmitter::new(factory)),
                writer: Mutex::new(None),
                tempo: Mutex::new(TempoHandle::default()),
                running: AtomicBool::new(false),
                fps: config.fps.max(1),
                started: Instant::now(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Builds the engine described by `config`: sACN (or in-memory) output,
    /// persistence at `config.config_path`, and the saved state restored.
    pub fn open(config: &EngineConfig) -> Self {
        let factory: Box<dyn SenderFactory> = if config.dry_run {
            info!("[ENGINE] Dry run: frames stay in memory");
            Box::new(MemoryFactory::new())
        } else {
            Box::new(SacnFactory::new(config.source_name.clone()))
        };
        let engine = Self::new(config, factory);

        let store = ConfigStore::new(config.config_path.clone());
        let doc = match store.load() {
            Ok(Some(doc)) => doc,
            Ok(None) => PersistedDocument::default(),
            Err(e) => {
                error!("[ENGINE] {}, starting empty", EngineError::persistence(&e));
                match store.set_aside() {
                    Ok(backup) => warn!("[ENGINE] Unreadable config kept at {:?}", backup),
                    Err(e) => error!("[ENGINE] {}", EngineError::persistence(&e)),
                }
                PersistedDocument::default()
            }
        };
        engine.attach_writer(PersistWriter::spawn(store));

        // nothing is written back until the first mutation
        let had_address = doc.bind_address.is_some();
        engine.restore(doc);
        if !had_address {
            if let Err(e) = engine.bind(config.bind_address.as_deref(), false) {
                warn!("[ENGINE] Output disabled until a bind succeeds: {}", e);
            }
        }
        engine
    }

    /// Persist every subsequent mutation through `writer`.
    pub fn attach_writer(&self, writer: PersistWriter) {
        *transmitter::lock(&self.shared.writer) = Some(writer);
    }

    pub fn attach_tempo(&self, tempo: TempoHandle) {
        *transmitter::lock(&self.shared.tempo) = tempo;
    }

    /// Loads a saved document: mode, effect, strips (geometry rebuilt) and
    /// masks, then binds the saved address if there is one.
    pub fn restore(&self, doc: PersistedDocument) {
        let address = doc.bind_address.clone();
        let (strips, masks) = {
            let mut state = self.shared.state();
            state.restore(doc);
            (state.strips.len(), state.masks.len())
        };
        info!("[ENGINE] Restored {} strip(s), {} mask(s)", strips, masks);

        if let Some(address) = address {
            if let Err(e) = self.bind(Some(&address), false) {
                warn!("[ENGINE] Saved bind address unusable: {}", e);
            }
        }
    }

    // --- Strips ---

    pub fn add_strip(&self, fields: NewStrip) -> EngineResult<u64> {
        let (id, universes, doc) = {
            let mut state = self.shared.state();
            let strip = PixelStrip::new(state.next_strip_id(), &fields);
            strip.validate()?;

            state.geometry.recompute(&strip);
            let id = strip.id;
            let universes = strip.required_universes();
            info!(
                "[ENGINE] Added strip {} (universe {}, channel {}, {} px)",
                id, strip.universe, strip.start_channel, strip.pixel_count
            );
            state.strips.push(strip);
            (id, universes, state.document())
        };

        self.shared.transmitter().activate_all(universes);
        self.shared.persist(doc);
        Ok(id)
    }

    pub fn update_strip(&self, id: u64, update: StripUpdate) -> EngineResult<()> {
        let (universes, doc) = {
            let mut state = self.shared.state();
            let current = state.strip_mut(id)?;

            let mut next = current.clone();
            if let Some(v) = update.universe {
                next.universe = v;
            }
            if let Some(v) = update.start_channel {
                next.start_channel = v;
            }
            if let Some(v) = update.pixel_count {
                next.pixel_count = v;
            }
            if let Some(v) = update.x {
                next.x = v;
            }
            if let Some(v) = update.y {
                next.y = v;
            }
            if let Some(v) = update.spacing {
                next.spacing = v;
            }
            if let Some(v) = update.rotation {
                next.rotation = v;
            }
            next.validate()?;

            if next.pixel_count != current.pixel_count {
                next.resize_buffer();
            }
            let addressing_changed = next.universe != current.universe
                || next.start_channel != current.start_channel
                || next.pixel_count != current.pixel_count;
            let universes = if addressing_changed {
                next.required_universes()
            } else {
                Vec::new()
            };

            *current = next;
            if update.touches_geometry() {
                let strip = current.clone();
                state.geometry.recompute(&strip);
            }
            debug!("[ENGINE] Updated strip {}", id);
            (universes, state.document())
        };

        self.shared.transmitter().activate_all(universes);
        self.shared.persist(doc);
        Ok(())
    }

    /// Moves several strips in one commit. Unknown ids are skipped; returns
    /// how many strips moved.
    pub fn update_layout(&self, updates: &[LayoutUpdate]) -> usize {
        let (moved, doc) = {
            let mut state = self.shared.state();
            let mut moved = 0;
            for u in updates {
                if !(u.x.is_finite() && u.y.is_finite()) {
                    warn!("[ENGINE] Ignoring non-finite position for strip {}", u.id);
                    continue;
                }
                let Ok(strip) = state.strip_mut(u.id) else {
                    warn!("[ENGINE] Layout update for unknown strip {}", u.id);
                    continue;
                };
                strip.x = u.x;
                strip.y = u.y;
                let strip = strip.clone();
                state.geometry.recompute(&strip);
                moved += 1;
            }
            (moved, state.document())
        };

        if moved > 0 {
            self.shared.persist(doc);
        }
        moved
    }

    pub fn move_strip(&self, id: u64, x: f32, y: f32) -> EngineResult<()> {
        self.update_strip(id, StripUpdate::position(x, y))
    }

    pub fn delete_strip(&self, id: u64) -> EngineResult<()> {
        let doc = {
            let mut state = self.shared.state();
            let before = state.strips.len();
            state.strips.retain(|s| s.id != id);
            if state.strips.len() == before {
                return Err(EngineError::StripNotFound(id));
            }
            state.geometry.remove(id);
            info!("[ENGINE] Deleted strip {}", id);
            state.document()
        };
        self.shared.persist(doc);
        Ok(())
    }

    // --- Masks ---

    pub fn add_mask(&self, fields: NewMask) -> EngineResult<u64> {
        let shape = MaskShape::from_params(fields.mask_type, &fields.params)?;
        let (id, doc) = {
            let mut state = self.shared.state();
            let id = state.next_mask_id();
            state.masks.push(Mask {
                id,
                x: fields.x,
                y: fields.y,
                shape,
            });
            info!("[ENGINE] Added mask {} ({})", id, fields.mask_type);
            (id, state.document())
        };
        self.shared.persist(doc);
        Ok(id)
    }

    pub fn update_mask(&self, id: u64, update: MaskUpdate) -> EngineResult<()> {
        let doc = {
            let mut state = self.shared.state();
            let mask = state
                .masks
                .iter_mut()
                .find(|m| m.id == id)
                .ok_or(EngineError::MaskNotFound(id))?;

            let shape = match (update.mask_type, update.params.as_ref()) {
                (Some(kind), params) if kind != mask.kind() => {
                    MaskShape::from_params(kind, params.unwrap_or(&Map::new()))?
                }
                (_, Some(params)) => mask.shape.merged(params)?,
                _ => mask.shape.clone(),
            };

            mask.shape = shape;
            if let Some(x) = update.x {
                mask.x = x;
            }
            if let Some(y) = update.y {
                mask.y = y;
            }
            debug!("[ENGINE] Updated mask {}", id);
            state.document()
        };
        self.shared.persist(doc);
        Ok(())
    }

    pub fn delete_mask(&self, id: u64) -> EngineResult<()> {
        let doc = {
            let mut state = self.shared.state();
            let before = state.masks.len();
            state.masks.retain(|m| m.id != id);
            if state.masks.len() == before {
                return Err(EngineError::MaskNotFound(id));
            }
            info!("[ENGINE] Deleted mask {}", id);
            state.document()
        };
        self.shared.persist(doc);
        Ok(())
    }

    // --- Mode, effect, speed ---

    /// Switches mode. A still-default effect follows along: `scanner` becomes
    /// `rainbow` in global mode and back again in spatial mode.
    pub fn set_mode(&self, mode: Mode) {
        let doc = {
            let mut state = self.shared.state();
            state.mode = mode;
            match (mode, GlobalEffect::from_name(&state.effect)) {
                (Mode::Global, Some(GlobalEffect::Scanner)) => {
                    state.effect = GlobalEffect::Rainbow.name().to_string();
                }
                (Mode::Spatial, Some(GlobalEffect::Rainbow)) => {
                    state.effect = GlobalEffect::Scanner.name().to_string();
                }
                _ => {}
            }
            info!("[ENGINE] Mode switched to: {} (effect {})", mode.as_str(), state.effect);
            state.document()
        };
        self.shared.persist(doc);
    }

    /// Selects a global effect by name. Unknown names are stored but render
    /// nothing, so strips keep their previous colors.
    pub fn set_effect(&self, name: &str) {
        if GlobalEffect::from_name(name).is_none() {
            warn!("[ENGINE] Unknown effect '{}', output will hold", name);
        }
        let doc = {
            let mut state = self.shared.state();
            state.effect = name.to_string();
            info!("[ENGINE] Effect switched to: {}", name);
            state.document()
        };
        self.shared.persist(doc);
    }

    pub fn set_speed(&self, speed: f32) {
        self.shared.state().speed = config::clamp_speed(speed);
    }

    // --- Network ---

    /// Rebinds the sACN source (`None` or empty for the wildcard address) and
    /// re-activates every universe the strips need.
    pub fn rebind(&self, address: Option<&str>) -> EngineResult<()> {
        self.bind(address, true)
    }

    fn bind(&self, address: Option<&str>, persist: bool) -> EngineResult<()> {
        let required = self.shared.state().required_universes();
        self.shared.transmitter().rebind(address, required)?;

        let doc = {
            let mut state = self.shared.state();
            state.bind_address = address
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string);
            persist.then(|| state.document())
        };
        if let Some(doc) = doc {
            self.shared.persist(doc);
        }
        Ok(())
    }

    // --- Render loop ---

    /// Starts the fixed-rate render thread. Ticks only transmit while a
    /// sender is bound.
    pub fn start(&self) {
        let mut worker = transmitter::lock(&self.worker);
        if worker.is_some() {
            return;
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        match thread::Builder::new()
            .name("pixelmap-render".into())
            .spawn(move || run_loop(shared))
        {
            Ok(handle) => {
                *worker = Some(handle);
                info!("[ENGINE] Render loop started");
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                error!("[ENGINE] Failed to start render thread: {}", e);
            }
        }
    }

    /// Finishes the in-flight tick, stops the loop and drops the sender.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let handle = transmitter::lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("[ENGINE] Render thread panicked");
            }
            info!("[ENGINE] Render loop stopped");
        }
        self.shared.transmitter().stop();
    }

    /// Stops everything and waits for pending saves.
    pub fn shutdown(&self) {
        self.stop();
        let writer = transmitter::lock(&self.shared.writer).take();
        if let Some(mut writer) = writer {
            writer.shutdown();
        }
    }

    /// Renders, packs and (when bound) transmits one frame for time `t`.
    pub fn tick_at(&self, t: f32) -> Frame {
        self.shared.tick_at(t)
    }

    pub fn tick(&self) -> Frame {
        self.shared.tick_at(self.shared.elapsed())
    }

    // --- Queries ---

    pub fn strips(&self) -> Vec<PixelStrip> {
        self.shared.state().strips.clone()
    }

    pub fn masks(&self) -> Vec<Mask> {
        self.shared.state().masks.clone()
    }

    pub fn pixel_coords(&self, id: u64) -> Option<Vec<Vec2>> {
        self.shared.state().geometry.get(id).map(<[Vec2]>::to_vec)
    }

    pub fn loop_state(&self) -> LoopState {
        let running = transmitter::lock(&self.worker).is_some();
        if running && self.shared.transmitter().is_bound() {
            LoopState::Running
        } else {
            LoopState::Idle
        }
    }

    pub fn status(&self) -> EngineStatus {
        let (mode, effect, speed, strips, masks) = {
            let state = self.shared.state();
            (
                state.mode,
                state.effect.clone(),
                state.speed,
                state.strips.len(),
                state.masks.len(),
            )
        };
        let (current_ip, active_universes) = {
            let tx = self.shared.transmitter();
            (tx.bind_address().map(str::to_string), tx.active_universes())
        };
        EngineStatus {
            current_ip,
            mode,
            effect,
            speed,
            state: self.loop_state(),
            fps: self.shared.fps,
            active_universes,
            strips,
            masks,
        }
    }

    pub fn tempo(&self) -> TempoSnapshot {
        transmitter::lock(&self.shared.tempo).snapshot()
    }

    pub fn document(&self) -> PersistedDocument {
        self.shared.state().document()
    }
}

impl Drop for LightingEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Animation clock wrap, a whole number of rainbow cycles (255 / 50 s).
const CLOCK_WRAP_SECS: f64 = 3570.0;

/// Seconds fed to the renderers. Reduced in `f64` before narrowing so `f32`
/// keeps sub-millisecond steps however long the engine runs.
fn animation_time(elapsed: Duration) -> f32 {
    (elapsed.as_secs_f64() % CLOCK_WRAP_SECS) as f32
}

fn run_loop(shared: Arc<Shared>) {
    let period = Duration::from_secs_f64(1.0 / shared.fps as f64);
    let mut frames: u64 = 0;

    while shared.running.load(Ordering::SeqCst) {
        let tick_start = Instant::now();

        if shared.transmitter().is_bound() {
            shared.tick_at(shared.elapsed());
            frames = frames.wrapping_add(1);
            if frames % (shared.fps as u64 * 60) == 0 {
                debug!("[ENGINE] {} frames rendered", frames);
            }
        }

        // overruns start the next tick immediately
        if let Some(rest) = period.checked_sub(tick_start.elapsed()) {
            thread::sleep(rest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MaskKind, RadialParams};
    use crate::packer::UniverseBuffer;
    use crate::transmitter::{DmxSender, SenderEvent};
    use std::sync::atomic::AtomicUsize;
    use serde_json::json;

    fn engine() -> (LightingEngine, MemoryFactory) {
        let factory = MemoryFactory::new();
        let config = EngineConfig {
            fps: 60,
            ..EngineConfig::default()
        };
        (LightingEngine::new(&config, Box::new(factory.clone())), factory)
    }

    fn new_strip(universe: u16, start_channel: u16, pixel_count: usize) -> NewStrip {
        NewStrip {
            universe,
            start_channel,
            pixel_count,
            ..Default::default()
        }
    }

    #[test]
    fn strip_ids_are_sequential() {
        let (engine, _) = engine();
        assert_eq!(engine.add_strip(new_strip(1, 1, 10)).unwrap(), 1);
        assert_eq!(engine.add_strip(new_strip(1, 31, 10)).unwrap(), 2);
        engine.delete_strip(1).unwrap();
        assert_eq!(engine.add_strip(new_strip(2, 1, 10)).unwrap(), 3);
    }

    #[test]
    fn invalid_strip_is_rejected() {
        let (engine, _) = engine();
        let err = engine.add_strip(new_strip(1, 0, 10)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidStrip(_)));
        assert!(engine.strips().is_empty());
    }

    #[test]
    fn update_recomputes_geometry_and_buffer() {
        let (engine, _) = engine();
        let id = engine.add_strip(new_strip(1, 1, 3)).unwrap();

        engine
            .update_strip(
                id,
                StripUpdate {
                    pixel_count: Some(5),
                    spacing: Some(0.1),
                    x: Some(0.2),
                    ..Default::default()
                },
            )
            .unwrap();

        let strip = &engine.strips()[0];
        assert_eq!(strip.data.len(), 5);
        let coords = engine.pixel_coords(id).unwrap();
        assert_eq!(coords.len(), 5);
        assert!((coords[0] - Vec2::new(0.0, 0.5)).length() < 1e-5);
        assert!((coords[4] - Vec2::new(0.4, 0.5)).length() < 1e-5);
    }

    #[test]
    fn failed_update_leaves_strip_untouched() {
        let (engine, _) = engine();
        let id = engine.add_strip(new_strip(1, 1, 3)).unwrap();
        let err = engine
            .update_strip(
                id,
                StripUpdate {
                    start_channel: Some(600),
                    pixel_count: Some(9),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStrip(_)));
        assert_eq!(engine.strips()[0].pixel_count, 3);
        assert!(matches!(
            engine.update_strip(99, StripUpdate::default()),
            Err(EngineError::StripNotFound(99))
        ));
    }

    #[test]
    fn delete_strip_drops_geometry() {
        let (engine, _) = engine();
        let id = engine.add_strip(new_strip(1, 1, 3)).unwrap();
        engine.delete_strip(id).unwrap();
        assert!(engine.pixel_coords(id).is_none());
        assert!(matches!(engine.delete_strip(id), Err(EngineError::StripNotFound(_))));
    }

    #[test]
    fn layout_batch_moves_known_strips() {
        let (engine, _) = engine();
        let a = engine.add_strip(new_strip(1, 1, 1)).unwrap();
        let b = engine.add_strip(new_strip(1, 4, 1)).unwrap();

        let moved = engine.update_layout(&[
            LayoutUpdate { id: a, x: 0.1, y: 0.2 },
            LayoutUpdate { id: 77, x: 0.3, y: 0.3 },
            LayoutUpdate { id: b, x: 0.9, y: 0.8 },
        ]);
        assert_eq!(moved, 2);
        assert_eq!(engine.pixel_coords(a).unwrap(), vec![Vec2::new(0.1, 0.2)]);
        assert_eq!(engine.pixel_coords(b).unwrap(), vec![Vec2::new(0.9, 0.8)]);
    }

    #[test]
    fn mask_lifecycle_merges_params() {
        let (engine, _) = engine();
        let id = engine
            .add_mask(NewMask::new(MaskKind::Radial).param("radius", 0.4))
            .unwrap();

        let mut patch = Map::new();
        patch.insert("color".into(), json!([10, 20, 30]));
        engine
            .update_mask(
                id,
                MaskUpdate {
                    x: Some(0.25),
                    params: Some(patch),
                    ..Default::default()
                },
            )
            .unwrap();

        let mask = &engine.masks()[0];
        assert_eq!(mask.x, 0.25);
        assert_eq!(
            mask.shape,
            MaskShape::Radial(RadialParams {
                radius: 0.4,
                color: [10, 20, 30]
            })
        );

        engine
            .update_mask(
                id,
                MaskUpdate {
                    mask_type: Some(MaskKind::Scanner),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(engine.masks()[0].kind(), MaskKind::Scanner);

        engine.delete_mask(id).unwrap();
        assert!(engine.masks().is_empty());
        assert!(matches!(engine.delete_mask(id), Err(EngineError::MaskNotFound(_))));
    }

    #[test]
    fn bad_mask_params_are_rejected() {
        let (engine, _) = engine();
        let err = engine
            .add_mask(NewMask::new(MaskKind::Scanner).param("width", "wide"))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidParams(_)));
        assert!(engine.masks().is_empty());
    }

    #[test]
    fn mode_switch_moves_default_effect() {
        let (engine, _) = engine();
        assert_eq!(engine.status().effect, "scanner");

        engine.set_mode(Mode::Global);
        assert_eq!(engine.status().effect, "rainbow");
        engine.set_mode(Mode::Spatial);
        assert_eq!(engine.status().effect, "scanner");

        engine.set_effect("chase");
        engine.set_mode(Mode::Global);
        assert_eq!(engine.status().effect, "chase");
    }

    #[test]
    fn unknown_effect_holds_previous_frame() {
        let (engine, _) = engine();
        engine.add_strip(new_strip(1, 1, 5)).unwrap();
        engine.set_mode(Mode::Global);
        engine.set_effect("chase");
        let before = engine.tick_at(0.0);

        engine.set_effect("strobe");
        let after = engine.tick_at(3.33);
        assert_eq!(before.get(1), after.get(1));
        assert_eq!(engine.status().effect, "strobe");
    }

    #[test]
    fn adding_strip_activates_spanned_universes() {
        let (engine, factory) = engine();
        engine.rebind(None).unwrap();
        engine.add_strip(new_strip(4, 511, 2)).unwrap();
        assert_eq!(factory.registered(), vec![4, 5]);
        assert_eq!(engine.status().active_universes, vec![4, 5]);
    }

    #[test]
    fn rebind_same_address_is_noop() {
        let (engine, factory) = engine();
        engine.add_strip(new_strip(1, 1, 200)).unwrap();
        engine.rebind(Some("10.0.0.8")).unwrap();
        let active = engine.status().active_universes;
        assert_eq!(active, vec![1, 2]);
        factory.clear();

        engine.rebind(Some("10.0.0.8")).unwrap();
        assert!(factory.events().is_empty());
        assert_eq!(engine.status().active_universes, active);
    }

    #[test]
    fn failed_rebind_goes_idle() {
        let (engine, factory) = engine();
        engine.rebind(None).unwrap();
        engine.start();
        assert_eq!(engine.loop_state(), LoopState::Running);

        factory.refuse("203.0.113.7");
        let err = engine.rebind(Some("203.0.113.7")).unwrap_err();
        assert!(matches!(err, EngineError::Bind { .. }));
        assert_eq!(engine.loop_state(), LoopState::Idle);
        assert_eq!(engine.status().current_ip, None);
        engine.stop();
    }

    #[test]
    fn loop_transmits_until_stopped() {
        let (engine, factory) = engine();
        engine.add_strip(new_strip(1, 1, 3)).unwrap();
        engine
            .add_mask(NewMask::new(MaskKind::Radial).param("radius", 1.0))
            .unwrap();
        engine.rebind(None).unwrap();
        engine.start();

        let deadline = Instant::now() + Duration::from_secs(5);
        while factory.sent_to(1).len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        engine.stop();

        let sent = factory.sent_to(1);
        assert!(sent.len() >= 3, "only {} frames sent", sent.len());
        assert!(sent.iter().all(|p| p.len() == 512));
        assert_eq!(engine.loop_state(), LoopState::Idle);

        // nothing goes out after stop returns
        let count = factory.sent_to(1).len();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(factory.sent_to(1).len(), count);
    }

    #[test]
    fn idle_engine_still_renders_frames() {
        let (engine, factory) = engine();
        engine.add_strip(new_strip(2, 1, 1)).unwrap();
        engine.add_mask(NewMask::new(MaskKind::Radial)).unwrap();

        let frame = engine.tick_at(0.0);
        assert_eq!(&frame.get(2).unwrap()[..3], &[255, 0, 255]);
        assert!(factory
            .events()
            .iter()
            .all(|e| !matches!(e, SenderEvent::Send(..))));
    }

    #[test]
    fn restore_rebuilds_state_and_binds() {
        let (engine, factory) = engine();
        let doc: PersistedDocument = serde_json::from_value(json!({
            "strips": [
                {"id": 5, "universe": 3, "pixel_count": 4, "start_channel": 1,
                 "x": 0.5, "y": 0.5, "spacing": 0.1, "rotation": 0.0},
                {"id": 6, "universe": 1, "pixel_count": 4, "start_channel": 0,
                 "x": 0.5, "y": 0.5, "spacing": 0.1, "rotation": 0.0}
            ],
            "masks": [{"id": 2, "type": "scanner", "x": 0.5, "y": 0.5, "params": {}}],
            "bind_address": "10.9.9.9",
            "mode": "global",
            "effect": "chase"
        }))
        .unwrap();

        engine.restore(doc);

        let strips = engine.strips();
        assert_eq!(strips.len(), 1, "strip with channel 0 is skipped");
        assert_eq!(strips[0].data.len(), 4);
        assert_eq!(engine.pixel_coords(5).unwrap().len(), 4);
        assert_eq!(engine.masks().len(), 1);

        let status = engine.status();
        assert_eq!(status.mode, Mode::Global);
        assert_eq!(status.effect, "chase");
        assert_eq!(status.current_ip.as_deref(), Some("10.9.9.9"));
        assert_eq!(status.active_universes, vec![3]);
        assert_eq!(factory.events()[0], SenderEvent::Bind(Some("10.9.9.9".into())));
    }

    struct SlowFactory {
        sends: Arc<AtomicUsize>,
    }

    struct SlowSender {
        sends: Arc<AtomicUsize>,
    }

    impl SenderFactory for SlowFactory {
        fn bind(&self, _address: Option<&str>) -> anyhow::Result<Box<dyn DmxSender>> {
            Ok(Box::new(SlowSender {
                sends: self.sends.clone(),
            }))
        }
    }

    impl DmxSender for SlowSender {
        fn register_universe(&mut self, _universe: u16) -> anyhow::Result<()> {
            Ok(())
        }

        fn send_universe(&mut self, _universe: u16, _data: &UniverseBuffer) -> anyhow::Result<()> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(400));
            Ok(())
        }
    }

    #[test]
    fn slow_network_does_not_block_control_calls() {
        let sends = Arc::new(AtomicUsize::new(0));
        let engine = LightingEngine::new(
            &EngineConfig::default(),
            Box::new(SlowFactory {
                sends: sends.clone(),
            }),
        );
        engine.add_strip(new_strip(1, 1, 10)).unwrap();
        engine.rebind(None).unwrap();
        engine.start();

        let deadline = Instant::now() + Duration::from_secs(5);
        while sends.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(sends.load(Ordering::SeqCst) > 0, "render loop never sent");

        let begun = Instant::now();
        let id = engine.add_strip(new_strip(2, 1, 10)).unwrap();
        engine.update_strip(id, StripUpdate::position(0.1, 0.1)).unwrap();
        engine.set_mode(Mode::Global);
        let status = engine.status();
        let took = begun.elapsed();
        engine.stop();

        assert!(took < Duration::from_millis(100), "control calls took {:?}", took);
        assert_eq!(status.active_universes, vec![1, 2]);
        assert_eq!(status.strips, 2);
    }

    #[test]
    fn animation_time_keeps_precision_on_long_runs() {
        let eleven_days = Duration::from_secs(11 * 24 * 3600);
        let a = animation_time(eleven_days);
        let b = animation_time(eleven_days + Duration::from_millis(33));
        assert!(((b - a) - 0.033).abs() < 1e-3, "step was {}", b - a);

        let wrapped = animation_time(Duration::from_secs_f64(CLOCK_WRAP_SECS + 1.5));
        assert!((wrapped - 1.5).abs() < 1e-4);
    }

    #[test]
    fn tempo_reads_attached_handle() {
        let (engine, _) = engine();
        assert_eq!(engine.tempo().bpm, 120.0);

        let handle = TempoHandle::default();
        handle.publish(TempoSnapshot { bpm: 174.0, peers: 3 });
        engine.attach_tempo(handle);
        assert_eq!(engine.tempo(), TempoSnapshot { bpm: 174.0, peers: 3 });
    }
}
