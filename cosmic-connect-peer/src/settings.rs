//! Per-device settings persistence
//!
//! The connection core only needs a scoped key-value store (one scope per
//! device id) and the set of trusted device ids. [`SettingsStore`] is that
//! capability; [`MemorySettings`] keeps everything in process and
//! [`JsonFileSettings`] writes the whole store to a JSON file on every change.

use crate::{PeerConfig, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// Settings key for the cached device name
pub const KEY_DEVICE_NAME: &str = "deviceName";

/// Settings key for the cached device type
pub const KEY_DEVICE_TYPE: &str = "deviceType";

/// Settings key for the trusted certificate (base64)
pub const KEY_CERTIFICATE: &str = "certificate";

/// Scoped key-value persistence plus the trusted-device set
pub trait SettingsStore: Send + Sync {
    /// Read a string value
    fn get_string(&self, scope: &str, key: &str) -> Option<String>;

    /// Store a string value
    fn put_string(&self, scope: &str, key: &str, value: &str) -> Result<()>;

    /// Read a boolean value
    fn get_bool(&self, scope: &str, key: &str) -> Option<bool>;

    /// Store a boolean value
    fn put_bool(&self, scope: &str, key: &str, value: bool) -> Result<()>;

    /// Remove a single key
    fn remove(&self, scope: &str, key: &str) -> Result<()>;

    /// Remove every key of a scope
    fn clear_scope(&self, scope: &str) -> Result<()>;

    /// Ids of all trusted devices
    fn trusted_devices(&self) -> Vec<String>;

    /// Whether `device_id` is trusted
    fn is_trusted(&self, device_id: &str) -> bool;

    /// Add or remove `device_id` from the trusted set
    fn set_trusted(&self, device_id: &str, trusted: bool) -> Result<()>;
}

/// Serialized form of a settings store
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct SettingsData {
    #[serde(default)]
    trusted_devices: BTreeSet<String>,
    #[serde(default)]
    scopes: BTreeMap<String, BTreeMap<String, Value>>,
}

impl SettingsData {
    fn get(&self, scope: &str, key: &str) -> Option<&Value> {
        self.scopes.get(scope).and_then(|values| values.get(key))
    }

    fn put(&mut self, scope: &str, key: &str, value: Value) {
        self.scopes
            .entry(scope.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    fn remove(&mut self, scope: &str, key: &str) {
        if let Some(values) = self.scopes.get_mut(scope) {
            values.remove(key);
            if values.is_empty() {
                self.scopes.remove(scope);
            }
        }
    }

    fn set_trusted(&mut self, device_id: &str, trusted: bool) {
        if trusted {
            self.trusted_devices.insert(device_id.to_string());
        } else {
            self.trusted_devices.remove(device_id);
        }
    }
}

fn lock(data: &Mutex<SettingsData>) -> MutexGuard<'_, SettingsData> {
    // Every mutation is a single map operation, so a poisoned guard still
    // holds consistent data.
    data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process settings store
#[derive(Debug, Default)]
pub struct MemorySettings {
    data: Mutex<SettingsData>,
}

impl MemorySettings {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get_string(&self, scope: &str, key: &str) -> Option<String> {
        lock(&self.data)
            .get(scope, key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn put_string(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        lock(&self.data).put(scope, key, Value::from(value));
        Ok(())
    }

    fn get_bool(&self, scope: &str, key: &str) -> Option<bool> {
        lock(&self.data).get(scope, key).and_then(Value::as_bool)
    }

    fn put_bool(&self, scope: &str, key: &str, value: bool) -> Result<()> {
        lock(&self.data).put(scope, key, Value::from(value));
        Ok(())
    }

    fn remove(&self, scope: &str, key: &str) -> Result<()> {
        lock(&self.data).remove(scope, key);
        Ok(())
    }

    fn clear_scope(&self, scope: &str) -> Result<()> {
        lock(&self.data).scopes.remove(scope);
        Ok(())
    }

    fn trusted_devices(&self) -> Vec<String> {
        lock(&self.data).trusted_devices.iter().cloned().collect()
    }

    fn is_trusted(&self, device_id: &str) -> bool {
        lock(&self.data).trusted_devices.contains(device_id)
    }

    fn set_trusted(&self, device_id: &str, trusted: bool) -> Result<()> {
        lock(&self.data).set_trusted(device_id, trusted);
        Ok(())
    }
}

/// Settings store persisted as a single JSON file
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    data: Mutex<SettingsData>,
}

impl JsonFileSettings {
    /// Open the store at `path`, loading existing content if present
    ///
    /// The parent directory is created when missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = if path.exists() {
            let json = fs::read_to_string(&path)?;
            let data: SettingsData = serde_json::from_str(&json)?;
            info!(
                "Loaded settings for {} devices ({} trusted) from {:?}",
                data.scopes.len(),
                data.trusted_devices.len(),
                path
            );
            data
        } else {
            debug!("No existing settings file at {:?}", path);
            SettingsData::default()
        };

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    /// Location of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the store at the location named by `config`
    pub fn from_config(config: &PeerConfig) -> Result<Self> {
        Self::open(&config.settings_path)
    }

    /// Apply `change` and persist it
    ///
    /// The in-memory store only takes the change once the file has been
    /// replaced, so a failed write leaves both sides at the previous state.
    fn mutate(&self, change: impl FnOnce(&mut SettingsData)) -> Result<()> {
        let mut data = lock(&self.data);
        let mut updated = data.clone();
        change(&mut updated);

        let json = serde_json::to_string_pretty(&updated)?;
        let staging = self.path.with_extension("json.tmp");
        fs::write(&staging, json)?;
        if let Err(e) = fs::rename(&staging, &self.path) {
            let _ = fs::remove_file(&staging);
            return Err(e.into());
        }

        *data = updated;
        debug!("Saved settings to {:?}", self.path);
        Ok(())
    }
}

impl SettingsStore for JsonFileSettings {
    fn get_string(&self, scope: &str, key: &str) -> Option<String> {
        lock(&self.data)
            .get(scope, key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn put_string(&self, scope: &str, key: &str, value: &str) -> Result<()> {
        self.mutate(|data| data.put(scope, key, Value::from(value)))
    }

    fn get_bool(&self, scope: &str, key: &str) -> Option<bool> {
        lock(&self.data).get(scope, key).and_then(Value::as_bool)
    }

    fn put_bool(&self, scope: &str, key: &str, value: bool) -> Result<()> {
        self.mutate(|data| data.put(scope, key, Value::from(value)))
    }

    fn remove(&self, scope: &str, key: &str) -> Result<()> {
        self.mutate(|data| data.remove(scope, key))
    }

    fn clear_scope(&self, scope: &str) -> Result<()> {
        self.mutate(|data| {
            data.scopes.remove(scope);
        })
    }

    fn trusted_devices(&self) -> Vec<String> {
        lock(&self.data).trusted_devices.iter().cloned().collect()
    }

    fn is_trusted(&self, device_id: &str) -> bool {
        lock(&self.data).trusted_devices.contains(device_id)
    }

    fn set_trusted(&self, device_id: &str, trusted: bool) -> Result<()> {
        self.mutate(|data| data.set_trusted(device_id, trusted))
    }
}
