//! Ableton Link tempo polling.
//!
//! The monitor runs on its own thread and only publishes a snapshot; the
//! engine reads it and never writes back.

use log::{debug, error, info};
use rusty_link::{AblLink, SessionState};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_BPM: f64 = 120.0;
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Serialize, Clone, Copy, Debug, PartialEq)]
pub struct TempoSnapshot {
    pub bpm: f64,
    pub peers: u64,
}

impl Default for TempoSnapshot {
    fn default() -> Self {
        Self {
            bpm: DEFAULT_BPM,
            peers: 0,
        }
    }
}

/// Shared, read-mostly view of the latest tempo.
#[derive(Clone, Default)]
pub struct TempoHandle {
    inner: Arc<Mutex<TempoSnapshot>>,
}

impl TempoHandle {
    pub fn snapshot(&self) -> TempoSnapshot {
        *self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn publish(&self, snapshot: TempoSnapshot) {
        *self.inner.lock().unwrap_or_else(|p| p.into_inner()) = snapshot;
    }
}

pub struct TempoMonitor {
    handle: TempoHandle,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TempoMonitor {
    /// Joins (or starts) a Link session and polls it every 20 ms.
    pub fn start() -> Self {
        let handle = TempoHandle::default();
        let running = Arc::new(AtomicBool::new(true));

        let thread = {
            let handle = handle.clone();
            let running = running.clone();
            thread::Builder::new()
                .name("pixelmap-link".into())
                .spawn(move || poll_link(handle, running))
        };

        let thread = match thread {
            Ok(t) => Some(t),
            Err(e) => {
                error!("[LINK] Failed to start tempo thread: {}", e);
                None
            }
        };

        Self {
            handle,
            running,
            thread,
        }
    }

    pub fn handle(&self) -> TempoHandle {
        self.handle.clone()
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("[LINK] Tempo thread panicked");
            }
        }
    }
}

impl Drop for TempoMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_link(handle: TempoHandle, running: Arc<AtomicBool>) {
    let link = AblLink::new(DEFAULT_BPM);
    link.enable(true);
    info!("[LINK] Ableton Link enabled at {} BPM", DEFAULT_BPM);

    let mut session_state = SessionState::new();
    let mut last_peers = 0;
    while running.load(Ordering::SeqCst) {
        link.capture_app_session_state(&mut session_state);
        let snapshot = TempoSnapshot {
            bpm: session_state.tempo(),
            peers: link.num_peers(),
        };
        if snapshot.peers != last_peers {
            info!("[LINK] {} peer(s) at {:.1} BPM", snapshot.peers, snapshot.bpm);
            last_peers = snapshot.peers;
        }
        handle.publish(snapshot);
        thread::sleep(POLL_INTERVAL);
    }

    link.enable(false);
    debug!("[LINK] Tempo thread finished");
}
