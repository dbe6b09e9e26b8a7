//! Per-device persistent state.
//!
//! Volume, mute and delay adjustments survive reconnects in one JSON file
//! per device under the storage root, named by the peer address. Zero
//! delay adjustments are not written; missing entries mean zero. The
//! in-memory map is guarded by a single process-wide mutex, matching the
//! low contention of device connect and disconnect events.

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    io::ErrorKind as IoErrorKind,
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::{a2dp::CodecId, asrsync::Decimillis, pcm::ChannelVolume, Address, Result};

/// Persisted state of one device.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    /// Per-channel volume levels in decibels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume: Vec<f64>,
    /// Per-channel soft-mute flags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mute: Vec<bool>,
    /// Whether volume is applied in-process.
    #[serde(default = "default_soft_volume")]
    pub soft_volume: bool,
    /// Client-delay adjustments in decimilliseconds, keyed by canonical
    /// codec name. Zero-valued entries are omitted.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub client_delays: HashMap<String, Decimillis>,
}

fn default_soft_volume() -> bool {
    true
}

impl DeviceState {
    /// Snapshot of the channel volumes for persisting.
    pub fn set_volumes(&mut self, volumes: &[ChannelVolume]) {
        self.volume = volumes.iter().map(|v| v.level_db).collect();
        self.mute = volumes.iter().map(|v| v.soft_mute).collect();
    }

    /// Restores channel volumes for the given channel count.
    pub fn volumes(&self, channels: usize) -> Vec<ChannelVolume> {
        (0..channels)
            .map(|i| ChannelVolume {
                level_db: self.volume.get(i).copied().unwrap_or(0.0),
                soft_mute: self.mute.get(i).copied().unwrap_or(false),
                hw_mute: false,
            })
            .collect()
    }

    /// Delay adjustment for a codec; zero when absent.
    pub fn client_delay(&self, codec: CodecId) -> Decimillis {
        codec.canonical_name().and_then(|name| self.client_delays.get(name)).copied().unwrap_or(0)
    }

    /// Records a delay adjustment, dropping zero entries.
    pub fn set_client_delay(&mut self, codec: CodecId, dms: Decimillis) {
        let Some(name) = codec.canonical_name() else { return };
        if dms == 0 {
            self.client_delays.remove(name);
        } else {
            self.client_delays.insert(name.to_string(), dms);
        }
    }
}

/// Persistent key-value store of per-device state.
#[derive(Debug)]
pub struct Storage {
    root: PathBuf,
    cache: Mutex<HashMap<Address, DeviceState>>,
}

impl Storage {
    /// Opens a store rooted at `root`, creating the directory as needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(crate::Error::from)?;
        Ok(Self { root, cache: Mutex::new(HashMap::new()) })
    }

    fn device_path(&self, addr: Address) -> PathBuf {
        self.root.join(format!("{addr}.json"))
    }

    /// Loads the state of a device, caching it for later saves.
    ///
    /// A device never seen before yields the default state.
    pub fn load(&self, addr: Address) -> DeviceState {
        let mut cache = self.cache.lock().unwrap();
        if let Some(state) = cache.get(&addr) {
            return state.clone();
        }
        let state = match fs::read(self.device_path(addr)) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
                log::warn!("Discarding corrupt device state for {addr}: {err}");
                DeviceState::default()
            }),
            Err(err) if err.kind() == IoErrorKind::NotFound => DeviceState::default(),
            Err(err) => {
                log::warn!("Cannot read device state for {addr}: {err}");
                DeviceState::default()
            }
        };
        cache.insert(addr, state.clone());
        state
    }

    /// Persists the state of a device.
    pub fn save(&self, addr: Address, state: &DeviceState) -> Result<()> {
        self.cache.lock().unwrap().insert(addr, state.clone());
        let raw = serde_json::to_vec_pretty(state)
            .map_err(|err| crate::Error::with_message(crate::ErrorKind::Failed, err.to_string()))?;
        write_atomically(&self.device_path(addr), &raw).map_err(crate::Error::from)?;
        log::debug!("Saved device state for {addr}");
        Ok(())
    }
}

/// Writes via a temporary file so a crash never leaves a torn state file.
fn write_atomically(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(tag: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("blaudio-storage-{tag}-{:08x}", rand::random::<u32>()));
        path
    }

    fn addr() -> Address {
        Address::new([0x00, 0x1B, 0xDC, 0x07, 0x32, 0x03])
    }

    #[test]
    fn load_unknown_device_yields_default() {
        let storage = Storage::new(temp_root("default")).unwrap();
        let state = storage.load(addr());
        assert_eq!(state, DeviceState::default());
        assert!(state.soft_volume);
        assert_eq!(state.client_delay(CodecId::Sbc), 0);
    }

    #[test]
    fn save_and_reload_round_trip() {
        let root = temp_root("roundtrip");
        let storage = Storage::new(&root).unwrap();

        let mut state = DeviceState::default();
        state.set_volumes(&[
            ChannelVolume { level_db: -6.0, ..ChannelVolume::default() },
            ChannelVolume { soft_mute: true, ..ChannelVolume::default() },
        ]);
        state.soft_volume = false;
        state.set_client_delay(CodecId::Mpeg24, 150);
        storage.save(addr(), &state).unwrap();

        // fresh instance reads from disk, not the cache
        let storage = Storage::new(&root).unwrap();
        let loaded = storage.load(addr());
        assert_eq!(loaded, state);
        assert_eq!(loaded.client_delay(CodecId::Mpeg24), 150);
        let volumes = loaded.volumes(2);
        assert_eq!(volumes[0].level_db, -6.0);
        assert!(volumes[1].soft_mute);
    }

    #[test]
    fn zero_delay_entries_are_not_written() {
        let mut state = DeviceState::default();
        state.set_client_delay(CodecId::Sbc, 100);
        state.set_client_delay(CodecId::Sbc, 0);
        assert!(state.client_delays.is_empty());

        state.set_client_delay(CodecId::APTX, 50);
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("aptX"));
        assert!(!json.contains("SBC"));
    }

    #[test]
    fn corrupt_state_file_is_discarded() {
        let root = temp_root("corrupt");
        let storage = Storage::new(&root).unwrap();
        fs::write(storage.device_path(addr()), b"not json").unwrap();
        assert_eq!(storage.load(addr()), DeviceState::default());
    }
}
