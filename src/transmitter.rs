use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use sacn::source::SacnSource;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use crate::error::{EngineError, EngineResult};
use crate::packer::{Frame, UniverseBuffer};

/// sACN priority used for every packet.
pub const SOURCE_PRIORITY: u8 = 100;
/// DMX null start code, prepended to each payload.
const START_CODE: u8 = 0;
const SEND_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// A bound network resource that can carry universes.
pub trait DmxSender: Send {
    fn register_universe(&mut self, universe: u16) -> Result<()>;
    fn send_universe(&mut self, universe: u16, data: &UniverseBuffer) -> Result<()>;
}

/// Creates senders; `None` means the wildcard address.
pub trait SenderFactory: Send + Sync {
    fn bind(&self, address: Option<&str>) -> Result<Box<dyn DmxSender>>;
}

pub struct SacnFactory {
    source_name: String,
}

impl SacnFactory {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
        }
    }
}

/// Accepts `ip`, `ip:port` or nothing (wildcard, ephemeral port).
pub fn parse_bind_address(address: Option<&str>) -> Result<SocketAddr> {
    match address.map(str::trim).filter(|a| !a.is_empty()) {
        None => Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)),
        Some(a) => a
            .parse::<SocketAddr>()
            .or_else(|_| a.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, 0)))
            .with_context(|| format!("'{}' is not an IP address", a)),
    }
}

impl SenderFactory for SacnFactory {
    fn bind(&self, address: Option<&str>) -> Result<Box<dyn DmxSender>> {
        let local_addr = parse_bind_address(address)?;
        debug!("[SACN] Binding to address: {}", local_addr);
        let source = SacnSource::with_ip(&self.source_name, local_addr)
            .map_err(|e| anyhow!("{:?}", e))?;
        info!("[SACN] Source '{}' bound on {}", self.source_name, local_addr);
        Ok(Box::new(SacnSender { source }))
    }
}

struct SacnSender {
    source: SacnSource,
}

impl DmxSender for SacnSender {
    fn register_universe(&mut self, universe: u16) -> Result<()> {
        self.source
            .register_universe(universe)
            .map_err(|e| anyhow!("{:?}", e))
    }

    fn send_universe(&mut self, universe: u16, data: &UniverseBuffer) -> Result<()> {
        let mut packet = Vec::with_capacity(data.len() + 1);
        packet.push(START_CODE);
        packet.extend_from_slice(data);
        // no destination: multicast
        self.source
            .send(&[universe], &packet, Some(SOURCE_PRIORITY), None, None)
            .map_err(|e| anyhow!("{:?}", e))
    }
}

/// A bound sender plus its warning throttle. Only ever locked around network
/// calls, never together with the transmitter's bookkeeping.
struct Output {
    sender: Box<dyn DmxSender>,
    last_warned: HashMap<u16, Instant>,
}

impl Output {
    fn register(&mut self, universe: u16) -> EngineResult<()> {
        self.sender
            .register_universe(universe)
            .map_err(|e| EngineError::transmit(universe, format!("{:#}", e)))?;
        info!("[SACN] Registered universe {}", universe);
        Ok(())
    }

    fn send(&mut self, universe: u16, data: &UniverseBuffer) -> EngineResult<()> {
        self.sender
            .send_universe(universe, data)
            .map_err(|e| EngineError::transmit(universe, format!("{:#}", e)))
    }

    fn warn_throttled(&mut self, universe: u16, err: &EngineError) {
        let now = Instant::now();
        let due = self
            .last_warned
            .get(&universe)
            .map_or(true, |t| now.duration_since(*t) >= SEND_WARN_INTERVAL);
        if due {
            warn!("[SACN] {}", err);
            self.last_warned.insert(universe, now);
        }
    }
}

/// Work for one frame, taken from the transmitter so the sends can run
/// after its lock is released.
pub struct Dispatch {
    output: Arc<Mutex<Output>>,
    register: Vec<u16>,
}

impl Dispatch {
    /// Registers queued universes, then sends every buffer in `frame`.
    /// Failures are logged at most once per universe per second. Returns the
    /// number of universes sent.
    pub fn send(self, frame: &Frame) -> usize {
        let mut output = lock(&self.output);
        for universe in self.register {
            if let Err(e) = output.register(universe) {
                output.warn_throttled(universe, &e);
            }
        }

        let mut sent = 0;
        for (universe, data) in frame.iter() {
            match output.send(universe, data) {
                Ok(()) => sent += 1,
                Err(e) => output.warn_throttled(universe, &e),
            }
        }
        sent
    }
}

/// Owns the set of universes being advertised and a handle to the sender.
pub struct Transmitter {
    factory: Box<dyn SenderFactory>,
    output: Option<Arc<Mutex<Output>>>,
    active: BTreeSet<u16>,
    // active but not yet registered because a send held the sender
    pending: BTreeSet<u16>,
    bind_address: Option<String>,
}

impl Transmitter {
    pub fn new(factory: Box<dyn SenderFactory>) -> Self {
        Self {
            factory,
            output: None,
            active: BTreeSet::new(),
            pending: BTreeSet::new(),
            bind_address: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.output.is_some()
    }

    pub fn bind_address(&self) -> Option<&str> {
        self.bind_address.as_deref()
    }

    pub fn active_universes(&self) -> Vec<u16> {
        self.active.iter().copied().collect()
    }

    pub fn is_active(&self, universe: u16) -> bool {
        self.active.contains(&universe)
    }

    /// Registers `universe` for multicast. No-op when already active or when
    /// nothing is bound. If a send currently holds the sender the
    /// registration is queued for the next frame instead of waiting.
    pub fn activate(&mut self, universe: u16) -> EngineResult<()> {
        if self.active.contains(&universe) {
            return Ok(());
        }
        let Some(output) = self.output.as_ref() else {
            return Ok(());
        };

        match output.try_lock() {
            Ok(mut output) => output.register(universe)?,
            Err(TryLockError::Poisoned(p)) => p.into_inner().register(universe)?,
            Err(TryLockError::WouldBlock) => {
                debug!("[SACN] Sender busy, universe {} queued", universe);
                self.pending.insert(universe);
            }
        }
        self.active.insert(universe);
        Ok(())
    }

    pub fn activate_all(&mut self, universes: impl IntoIterator<Item = u16>) {
        for u in universes {
            if let Err(e) = self.activate(u) {
                error!("[SACN] {}", e);
            }
        }
    }

    /// Marks every universe in `frame` active and hands back what the frame
    /// needs sent. `None` while unbound.
    pub fn prepare(&mut self, frame: &Frame) -> Option<Dispatch> {
        let output = self.output.clone()?;
        for universe in frame.universe_ids() {
            if self.active.insert(universe) {
                self.pending.insert(universe);
            }
        }
        let register = std::mem::take(&mut self.pending).into_iter().collect();
        Some(Dispatch { output, register })
    }

    /// Prepares and sends `frame` in one go, holding `self` for the sends.
    pub fn send_frame(&mut self, frame: &Frame) -> usize {
        self.prepare(frame).map_or(0, |dispatch| dispatch.send(frame))
    }

    /// Replaces the sender with one bound at `address` (empty or `None` for the
    /// wildcard) and re-activates `required`. Rebinding to the address already
    /// in use keeps the current sender and active set.
    pub fn rebind(
        &mut self,
        address: Option<&str>,
        required: impl IntoIterator<Item = u16>,
    ) -> EngineResult<()> {
        let address = address.map(str::trim).filter(|a| !a.is_empty());
        if self.is_bound() && self.bind_address.as_deref() == address {
            debug!("[SACN] Already bound on {:?}", address);
            return Ok(());
        }

        self.stop();
        let shown = address.unwrap_or("0.0.0.0").to_string();
        info!("[SACN] Starting sACN sender on {}...", shown);

        match self.factory.bind(address) {
            Ok(sender) => {
                self.output = Some(Arc::new(Mutex::new(Output {
                    sender,
                    last_warned: HashMap::new(),
                })));
                self.bind_address = address.map(str::to_string);
                self.activate_all(required);
                Ok(())
            }
            Err(e) => {
                error!("[SACN] Failed to start sender on {}: {:#}", shown, e);
                Err(EngineError::bind(shown, format!("{:#}", e)))
            }
        }
    }

    /// Drops the sender and forgets every active universe. A dispatch still in
    /// flight finishes on the old sender.
    pub fn stop(&mut self) {
        if self.output.take().is_some() {
            info!("[SACN] Sender stopped");
        }
        self.active.clear();
        self.pending.clear();
        self.bind_address = None;
    }
}

/// What an in-memory sender has seen.
#[derive(Clone, Debug, PartialEq)]
pub enum SenderEvent {
    Bind(Option<String>),
    Register(u16),
    Send(u16, Vec<u8>),
}

/// Sender that records traffic instead of touching the network. Used for
/// dry runs and tests.
#[derive(Clone, Default)]
pub struct MemoryFactory {
    events: Arc<Mutex<Vec<SenderEvent>>>,
    refuse: Arc<Mutex<Vec<String>>>,
    fail_sends: Arc<Mutex<bool>>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes future binds to `address` fail.
    pub fn refuse(&self, address: &str) {
        lock(&self.refuse).push(address.to_string());
    }

    pub fn set_fail_sends(&self, fail: bool) {
        *lock(&self.fail_sends) = fail;
    }

    pub fn events(&self) -> Vec<SenderEvent> {
        lock(&self.events).clone()
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    pub fn registered(&self) -> Vec<u16> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SenderEvent::Register(u) => Some(u),
                _ => None,
            })
            .collect()
    }

    /// Payloads sent to `universe`, oldest first.
    pub fn sent_to(&self, universe: u16) -> Vec<Vec<u8>> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SenderEvent::Send(u, data) if u == universe => Some(data),
                _ => None,
            })
            .collect()
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl SenderFactory for MemoryFactory {
    fn bind(&self, address: Option<&str>) -> Result<Box<dyn DmxSender>> {
        if let Some(a) = address {
            if lock(&self.refuse).iter().any(|r| r == a) {
                return Err(anyhow!("cannot assign requested address {}", a));
            }
        }
        lock(&self.events).push(SenderEvent::Bind(address.map(str::to_string)));
        Ok(Box::new(MemorySender {
            factory: self.clone(),
        }))
    }
}

struct MemorySender {
    factory: MemoryFactory,
}

impl DmxSender for MemorySender {
    fn register_universe(&mut self, universe: u16) -> Result<()> {
        lock(&self.factory.events).push(SenderEvent::Register(universe));
        Ok(())
    }

    fn send_universe(&mut self, universe: u16, data: &UniverseBuffer) -> Result<()> {
        if *lock(&self.factory.fail_sends) {
            return Err(anyhow!("network unreachable"));
        }
        lock(&self.factory.events).push(SenderEvent::Send(universe, data.to_vec()));
        Ok(())
    }
}
