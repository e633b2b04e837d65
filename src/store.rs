use anyhow::{Context, Result};
use log::{debug, error, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::model::PersistedDocument;

/// JSON document on disk holding strips, masks and engine settings.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no document has been written yet.
    pub fn load(&self) -> Result<Option<PersistedDocument>> {
        if !self.path.exists() {
            info!("[STORE] No config at {:?}, starting empty", self.path);
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {:?}", self.path))?;
        let doc = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {:?}", self.path))?;
        Ok(Some(doc))
    }

    /// Writes through a sibling temp file so a crash never leaves half a
    /// document behind.
    pub fn save(&self, doc: &PersistedDocument) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory {:?}", dir))?;
        }
        let json = serde_json::to_string_pretty(doc).context("Failed to serialize state")?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move {:?} into place", tmp))?;
        debug!("[STORE] Saved state to {:?}", self.path);
        Ok(())
    }

    /// Moves an unreadable document to `<name>.json.bak` so the next save
    /// cannot overwrite it. Returns the backup path.
    pub fn set_aside(&self) -> Result<PathBuf> {
        let backup = self.path.with_extension("json.bak");
        fs::rename(&self.path, &backup)
            .with_context(|| format!("Failed to move {:?} aside", self.path))?;
        Ok(backup)
    }
}

/// Background writer. Callers hand over snapshots and return immediately;
/// the worker writes the newest one it has and logs failures.
pub struct PersistWriter {
    tx: Option<Sender<PersistedDocument>>,
    handle: Option<JoinHandle<()>>,
}

impl PersistWriter {
    pub fn spawn(store: ConfigStore) -> Self {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("pixelmap-store".into())
            .spawn(move || run_writer(store, rx));

        match handle {
            Ok(handle) => Self {
                tx: Some(tx),
                handle: Some(handle),
            },
            Err(e) => {
                error!("[STORE] Failed to start writer thread: {}", e);
                Self {
                    tx: None,
                    handle: None,
                }
            }
        }
    }

    pub fn submit(&self, doc: PersistedDocument) {
        match &self.tx {
            Some(tx) => {
                if tx.send(doc).is_err() {
                    error!("[STORE] Writer thread is gone, state not saved");
                }
            }
            None => error!("[STORE] No writer thread, state not saved"),
        }
    }

    /// Waits for queued writes to land.
    pub fn shutdown(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("[STORE] Writer thread panicked");
            }
        }
    }
}

impl Drop for PersistWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_writer(store: ConfigStore, rx: Receiver<PersistedDocument>) {
    while let Ok(mut doc) = rx.recv() {
        // only the newest snapshot matters
        while let Ok(newer) = rx.try_recv() {
            doc = newer;
        }
        if let Err(e) = store.save(&doc) {
            error!("[STORE] Failed to save state: {:#}", e);
        }
    }
    debug!("[STORE] Writer finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Mode, NewStrip, PixelStrip};

    fn scratch_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pixelmap-store-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir.join("nested").join("lighting_config.json")
    }

    fn document(effect: &str) -> PersistedDocument {
        PersistedDocument {
            strips: vec![PixelStrip::new(4, &NewStrip::default())],
            masks: Vec::new(),
            bind_address: Some("10.1.1.1".into()),
            mode: Mode::Global,
            effect: effect.into(),
        }
    }

    #[test]
    fn missing_file_loads_as_none() {
        let store = ConfigStore::new(scratch_path("missing"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_creates_directories_and_reloads() {
        let store = ConfigStore::new(scratch_path("reload"));
        store.save(&document("chase")).unwrap();

        let doc = store.load().unwrap().unwrap();
        assert_eq!(doc.effect, "chase");
        assert_eq!(doc.mode, Mode::Global);
        assert_eq!(doc.strips.len(), 1);
        assert_eq!(doc.strips[0].id, 4);
        // color buffers are not persisted
        assert!(doc.strips[0].data.is_empty());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let path = scratch_path("corrupt");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ strips: nope").unwrap();
        let store = ConfigStore::new(&path);
        assert!(store.load().is_err());

        let backup = store.set_aside().unwrap();
        assert!(!path.exists());
        assert_eq!(fs::read_to_string(backup).unwrap(), "{ strips: nope");
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn writer_lands_latest_snapshot() {
        let store = ConfigStore::new(scratch_path("writer"));
        let mut writer = PersistWriter::spawn(store.clone());
        writer.submit(document("scanner"));
        writer.submit(document("rainbow"));
        writer.shutdown();

        assert_eq!(store.load().unwrap().unwrap().effect, "rainbow");
    }
}
