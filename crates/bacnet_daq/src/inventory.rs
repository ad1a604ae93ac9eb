//! Durable discovery inventory
//!
//! Discovery results are merged into a JSON file keyed by device id. Writes
//! happen on a background thread so polling never waits on the disk.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use crate::discovery::RemoteDeviceSummary;
use crate::model::DeviceId;

pub type Inventory = BTreeMap<DeviceId, RemoteDeviceSummary>;

/// JSON file holding the latest summary per device
#[derive(Debug, Clone)]
pub struct InventoryStore {
    path: PathBuf,
}

impl InventoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current contents; a missing file is an empty inventory
    pub fn load(&self) -> io::Result<Inventory> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Inventory::new()),
            Err(e) => Err(e),
        }
    }

    /// Replace the entries of the given devices, keeping all others
    pub fn merge(&self, summaries: &[RemoteDeviceSummary]) -> io::Result<()> {
        let mut inventory = match self.load() {
            Ok(inventory) => inventory,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                // Keep the damaged file for inspection instead of overwriting it
                let aside = self.corrupt_path();
                fs::rename(&self.path, &aside)?;
                tracing::warn!(
                    path = %self.path.display(),
                    moved_to = %aside.display(),
                    error = %e,
                    "Corrupt inventory set aside, starting fresh"
                );
                Inventory::new()
            }
            Err(e) => return Err(e),
        };
        for summary in summaries {
            inventory.insert(summary.device_id, summary.clone());
        }

        let json = serde_json::to_vec_pretty(&inventory)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)
    }

    fn corrupt_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".corrupt");
        PathBuf::from(name)
    }
}

enum InventoryMessage {
    Update(Vec<RemoteDeviceSummary>),
    Flush(mpsc::Sender<()>),
}

/// Fire-and-forget handle to the inventory writer thread
///
/// Cloned into every group. The thread exits once the last clone is
/// dropped.
#[derive(Clone)]
pub struct InventorySink {
    tx: mpsc::Sender<InventoryMessage>,
}

impl InventorySink {
    pub fn spawn(store: InventoryStore) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<InventoryMessage>();
        thread::Builder::new()
            .name("inventory-writer".to_string())
            .spawn(move || {
                while let Ok(message) = rx.recv() {
                    match message {
                        InventoryMessage::Update(summaries) => {
                            match store.merge(&summaries) {
                                Ok(()) => tracing::debug!(
                                    devices = summaries.len(),
                                    path = %store.path().display(),
                                    "Inventory updated"
                                ),
                                Err(e) => tracing::warn!(
                                    path = %store.path().display(),
                                    error = %e,
                                    "Failed to write inventory"
                                ),
                            }
                        }
                        InventoryMessage::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })?;
        Ok(Self { tx })
    }

    /// Queue summaries for writing; never blocks on I/O
    pub fn record(&self, summaries: Vec<RemoteDeviceSummary>) {
        if summaries.is_empty() {
            return;
        }
        if self.tx.send(InventoryMessage::Update(summaries)).is_err() {
            tracing::warn!("Inventory writer has stopped, dropping discovery results");
        }
    }

    /// Wait until everything queued so far is on disk
    pub fn flush(&self) {
        let (done, rx) = mpsc::channel();
        if self.tx.send(InventoryMessage::Flush(done)).is_ok() {
            let _ = rx.recv();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bacnet_stack::Segmentation;
    use chrono::Utc;

    fn summary(device_id: DeviceId, text: &str) -> RemoteDeviceSummary {
        RemoteDeviceSummary {
            device_id,
            device_instance: device_id * 10,
            address: "192.168.1.20:47808".parse().unwrap(),
            max_apdu: 1476,
            segmentation: Segmentation::NoSegmentation,
            vendor_id: 260,
            vendor_name: None,
            model_name: None,
            objects: Vec::new(),
            summary: text.to_string(),
            discovered_at: Utc::now(),
        }
    }

    #[test]
    fn test_merge_keeps_other_devices() {
        let dir = tempfile::tempdir().unwrap();
        let store = InventoryStore::new(dir.path().join("inventory.json"));

        store.merge(&[summary(2, "first"), summary(3, "other")]).unwrap();
        store.merge(&[summary(2, "second")]).unwrap();

        let inventory = store.load().unwrap();
        assert_eq!(inventory.len(), 2);
        assert_eq!(inventory[&2].summary, "second");
        assert_eq!(inventory[&3].summary, "other");
    }

    #[test]
    fn test_sink_writes_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let store = InventoryStore::new(dir.path().join("nested").join("inventory.json"));
        let sink = InventorySink::spawn(store.clone()).unwrap();

        sink.record(vec![summary(4, "ahu")]);
        sink.record(Vec::new());
        sink.flush();

        assert_eq!(store.load().unwrap()[&4].summary, "ahu");
    }

    #[test]
    fn test_corrupt_file_is_set_aside_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        fs::write(&path, b"{ not json").unwrap();
        let store = InventoryStore::new(&path);
        assert_eq!(store.load().unwrap_err().kind(), io::ErrorKind::InvalidData);

        store.merge(&[summary(5, "vav")]).unwrap();

        let aside = dir.path().join("inventory.json.corrupt");
        assert_eq!(fs::read(&aside).unwrap(), b"{ not json");
        let inventory = store.load().unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[&5].summary, "vav");
    }

    #[test]
    fn test_unreadable_path_is_not_replaced() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be cannot be read as one
        let path = dir.path().join("inventory.json");
        fs::create_dir(&path).unwrap();
        let store = InventoryStore::new(&path);

        assert!(store.merge(&[summary(6, "fcu")]).is_err());
        assert!(path.is_dir());
        assert!(!dir.path().join("inventory.json.corrupt").exists());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = InventoryStore::new(dir.path().join("absent.json"));
        assert!(store.load().unwrap().is_empty());
    }
}
